use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use ulid::Ulid;

use crate::model::Actor;

/// Shared-secret password check for every user name. Who the caller is comes
/// from the user name itself, issued by the session collaborator.
#[derive(Debug)]
pub struct CarebookAuthSource {
    password: String,
}

impl CarebookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for CarebookAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// `owner:<ulid>`, `caregiver:<ulid>` or `admin`.
pub fn resolve_actor(user: &str) -> Option<Actor> {
    let user = user.trim();
    if user.eq_ignore_ascii_case("admin") {
        return Some(Actor::admin());
    }
    let (role, id) = user.split_once(':')?;
    let id = Ulid::from_string(id.trim()).ok()?;
    match role.trim().to_ascii_lowercase().as_str() {
        "owner" => Some(Actor::owner(id)),
        "caregiver" => Some(Actor::caregiver(id)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    #[test]
    fn resolves_roles() {
        let id = Ulid::new();
        assert_eq!(resolve_actor(&format!("owner:{id}")), Some(Actor::owner(id)));
        assert_eq!(resolve_actor(&format!("Caregiver:{id}")), Some(Actor::caregiver(id)));
        assert_eq!(resolve_actor("admin").map(|a| a.role), Some(Role::Admin));
    }

    #[test]
    fn rejects_unknown_users() {
        assert!(resolve_actor("postgres").is_none());
        assert!(resolve_actor("owner:not-a-ulid").is_none());
        assert!(resolve_actor(&format!("walker:{}", Ulid::new())).is_none());
    }
}
