use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::config::Secret;

/// Whether the caller may change the schedule. How that was decided
/// (which secret, which login) is not the core's business.
pub trait AuthorizationChecker: Send + Sync {
    fn is_privileged(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Guard view: lookups and the board.
    Viewer,
    /// Office: may edit, assign and release.
    Office,
}

impl AuthorizationChecker for Role {
    fn is_privileged(&self) -> bool {
        *self == Role::Office
    }
}

/// Role of an authenticated login.
pub fn role_for_user(user: Option<&str>, office_user: &str) -> Role {
    match user {
        Some(u) if u == office_user => Role::Office,
        _ => Role::Viewer,
    }
}

/// Password lookup for the startup handshake: the office login checks the
/// office secret, any other login the shared viewer code.
#[derive(Debug, Clone)]
pub struct YardAuthSource {
    office_user: String,
    office_secret: Option<Secret>,
    viewer_password: Secret,
}

impl YardAuthSource {
    pub fn new(office_user: String, office_secret: Option<Secret>, viewer_password: Secret) -> Self {
        Self {
            office_user,
            office_secret,
            viewer_password,
        }
    }

    fn password_for(&self, user: Option<&str>) -> Option<&Secret> {
        match role_for_user(user, &self.office_user) {
            Role::Office => self.office_secret.as_ref(),
            Role::Viewer => Some(&self.viewer_password),
        }
    }
}

#[async_trait]
impl AuthSource for YardAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        match self.password_for(login.user()) {
            Some(secret) => Ok(Password::new(None, secret.expose().as_bytes().to_vec())),
            None => {
                metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
                tracing::warn!("office login refused: no office secret configured");
                Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                    "FATAL".to_owned(),
                    "28P01".to_owned(),
                    "office role is disabled".to_owned(),
                ))))
            }
        }
    }
}
