use clap::Subcommand;
use tabled::{Table, Tabled};

use mcvirt_proto::auth::{Permission, UserInfo, UserKind};
use mcvirt_proto::request::AuthOp;
use mcvirt_proto::{McvError, McvResult, Reply, Request};

use crate::common::{print_success, Client};

#[derive(Subcommand, Debug)]
pub enum UserCommands {
    /// Create a local user
    Create {
        username: String,
        #[arg(long)]
        new_password: String,
    },
    /// Delete a local user
    Delete { username: String },
    /// Change a password (your own unless --target-user is given)
    ChangePassword {
        #[arg(long)]
        new_password: String,
        #[arg(long)]
        target_user: Option<String>,
    },
    /// Grant a permission
    Grant {
        username: String,
        permission: Permission,
    },
    /// Revoke a permission
    Revoke {
        username: String,
        permission: Permission,
    },
    /// Make a user superuser, or with --remove take it away
    Superuser {
        username: String,
        #[arg(long)]
        remove: bool,
    },
    /// List users
    List,
}

#[derive(Tabled)]
struct UserRow {
    #[tabled(rename = "User")]
    username: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Superuser")]
    superuser: bool,
    #[tabled(rename = "Permissions")]
    permissions: String,
}

impl From<&UserInfo> for UserRow {
    fn from(user: &UserInfo) -> Self {
        Self {
            username: user.username.clone(),
            kind: user.kind.to_string(),
            superuser: user.superuser,
            permissions: user
                .permissions
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

fn auth(op: AuthOp) -> Request {
    Request::Auth(op)
}

/// Execute a user subcommand.
pub async fn run(client: &Client, command: UserCommands) -> McvResult<()> {
    match command {
        UserCommands::Create { username, new_password } => {
            client
                .run(auth(AuthOp::CreateUser {
                    username: username.clone(),
                    password: new_password,
                    kind: UserKind::Local,
                }))
                .await?;
            print_success(&format!("Created user {}", username));
        }
        UserCommands::Delete { username } => {
            client
                .run(auth(AuthOp::DeleteUser {
                    username: username.clone(),
                }))
                .await?;
            print_success(&format!("Deleted user {}", username));
        }
        UserCommands::ChangePassword {
            new_password,
            target_user,
        } => {
            client
                .run(auth(AuthOp::ChangePassword {
                    username: target_user,
                    new_password,
                }))
                .await?;
            print_success("Password changed");
        }
        UserCommands::Grant { username, permission } => {
            client
                .run(auth(AuthOp::SetPermission {
                    username: username.clone(),
                    permission,
                    granted: true,
                }))
                .await?;
            print_success(&format!("Granted {} to {}", permission, username));
        }
        UserCommands::Revoke { username, permission } => {
            client
                .run(auth(AuthOp::SetPermission {
                    username: username.clone(),
                    permission,
                    granted: false,
                }))
                .await?;
            print_success(&format!("Revoked {} from {}", permission, username));
        }
        UserCommands::Superuser { username, remove } => {
            client
                .run(auth(AuthOp::SetSuperuser {
                    username,
                    superuser: !remove,
                }))
                .await?;
        }
        UserCommands::List => match client.call(auth(AuthOp::ListUsers)).await? {
            Reply::Users(users) => {
                let rows: Vec<UserRow> = users.iter().map(UserRow::from).collect();
                println!("{}", Table::new(rows));
            }
            other => return Err(McvError::UnexpectedReply(format!("{:?}", other))),
        },
    }
    Ok(())
}

/// Authenticate and cache the session for later commands.
pub async fn login(client: &Client) -> McvResult<()> {
    client.run(auth(AuthOp::Login)).await?;
    print_success("Logged in");
    Ok(())
}
