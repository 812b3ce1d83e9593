use std::sync::Arc;

use bytes::Bytes;
use hashbrown::HashMap;

use crate::config::{AuthConfig, Role};
use crate::error::ProxyError;
use crate::protocol::redis::{CmdKind, RedisCommand, RespValue};

struct AuthUser {
    secret: Vec<u8>,
    role: Role,
}

/// Verifies credentials and answers permission queries.
///
/// With no users configured the proxy is open and sessions act with admin
/// rights; otherwise every session starts unauthenticated and only
/// AUTH/HELLO/PING/QUIT pass until a login succeeds.
pub struct Authority {
    users: HashMap<String, AuthUser>,
}

pub const DEFAULT_USER: &str = "default";

impl Authority {
    pub fn from_config(config: Option<&AuthConfig>) -> Arc<Self> {
        let mut users = HashMap::new();
        if let Some(config) = config {
            for user in &config.users {
                users.insert(
                    user.username.clone(),
                    AuthUser {
                        secret: user.password.clone().into_bytes(),
                        role: user.role,
                    },
                );
            }
        }
        Arc::new(Self { users })
    }

    /// True when no credentials are required.
    pub fn is_open(&self) -> bool {
        self.users.is_empty()
    }

    pub fn new_session(&self) -> SessionAuth {
        if self.is_open() {
            SessionAuth {
                user: None,
                role: Role::Admin,
                authenticated: true,
            }
        } else {
            SessionAuth {
                user: None,
                role: Role::Read,
                authenticated: false,
            }
        }
    }

    /// Handle `AUTH [user] <password>`, updating the session on success.
    pub fn process_auth(&self, state: &mut SessionAuth, command: &RedisCommand) -> RespValue {
        if self.is_open() {
            return RespValue::error(
                b"ERR Client sent AUTH, but no password is set.".as_ref(),
            );
        }
        let args = command.args();
        let (username, password) = match args.len() {
            2 => (DEFAULT_USER.to_string(), &args[1]),
            3 => match std::str::from_utf8(&args[1]) {
                Ok(name) => (name.to_string(), &args[2]),
                Err(_) => return wrongpass(),
            },
            _ => {
                return ProxyError::WrongArgCount("auth".to_string()).to_resp();
            }
        };

        match self.users.get(&username) {
            Some(user) if constant_eq(&user.secret, password) => {
                state.user = Some(username);
                state.role = user.role;
                state.authenticated = true;
                RespValue::ok()
            }
            _ => wrongpass(),
        }
    }

    /// Commands a role may issue; CONFIG SET additionally requires admin,
    /// enforced at the call site.
    pub fn permits(&self, role: Role, kind: CmdKind) -> bool {
        match kind {
            CmdKind::Read | CmdKind::Ctrl => true,
            CmdKind::Write | CmdKind::Txn | CmdKind::Sub => {
                matches!(role, Role::Write | Role::Admin)
            }
            CmdKind::NotSupport => true,
        }
    }
}

fn wrongpass() -> RespValue {
    RespValue::Error(Bytes::from_static(
        b"WRONGPASS invalid username-password pair",
    ))
}

fn constant_eq(expected: &[u8], supplied: &Bytes) -> bool {
    if expected.len() != supplied.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in expected.iter().zip(supplied.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

/// Per-session authentication state.
pub struct SessionAuth {
    pub user: Option<String>,
    pub role: Role,
    pub authenticated: bool,
}

impl SessionAuth {
    /// Commands allowed before authentication.
    pub fn allowed_preauth(command: &RedisCommand) -> bool {
        matches!(command.name(), b"AUTH" | b"HELLO" | b"PING" | b"QUIT")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthUserConfig;

    fn authority() -> Arc<Authority> {
        Authority::from_config(Some(&AuthConfig {
            users: vec![
                AuthUserConfig {
                    username: DEFAULT_USER.to_string(),
                    password: "secret".to_string(),
                    role: Role::Write,
                },
                AuthUserConfig {
                    username: "viewer".to_string(),
                    password: "peek".to_string(),
                    role: Role::Read,
                },
            ],
        }))
    }

    fn cmd(parts: &[&[u8]]) -> RedisCommand {
        RedisCommand::new(parts.iter().map(|p| Bytes::copy_from_slice(p)).collect()).unwrap()
    }

    #[test]
    fn sessions_start_unauthenticated_when_users_exist() {
        let authority = authority();
        let state = authority.new_session();
        assert!(!state.authenticated);
        assert!(SessionAuth::allowed_preauth(&cmd(&[b"PING"])));
        assert!(!SessionAuth::allowed_preauth(&cmd(&[b"GET", b"k"])));
    }

    #[test]
    fn password_only_auth_uses_default_user() {
        let authority = authority();
        let mut state = authority.new_session();
        let reply = authority.process_auth(&mut state, &cmd(&[b"AUTH", b"secret"]));
        assert_eq!(reply, RespValue::ok());
        assert!(state.authenticated);
        assert_eq!(state.role, Role::Write);
    }

    #[test]
    fn wrong_password_is_rejected() {
        let authority = authority();
        let mut state = authority.new_session();
        let reply = authority.process_auth(&mut state, &cmd(&[b"AUTH", b"nope"]));
        assert!(reply.is_error());
        assert!(!state.authenticated);
        let reply = authority.process_auth(&mut state, &cmd(&[b"AUTH", b"ghost", b"x"]));
        assert!(reply.is_error());
    }

    #[test]
    fn read_role_cannot_write() {
        let authority = authority();
        let mut state = authority.new_session();
        authority.process_auth(&mut state, &cmd(&[b"AUTH", b"viewer", b"peek"]));
        assert_eq!(state.role, Role::Read);
        assert!(authority.permits(state.role, CmdKind::Read));
        assert!(!authority.permits(state.role, CmdKind::Write));
        assert!(!authority.permits(state.role, CmdKind::Txn));
    }

    #[test]
    fn open_proxy_grants_admin() {
        let authority = Authority::from_config(None);
        let state = authority.new_session();
        assert!(state.authenticated);
        assert_eq!(state.role, Role::Admin);
    }
}
