//! Caller identity and impersonation
//!
//! The daemon never trusts a name sent in-band. The connecting account comes
//! from the socket's peer credentials and is resolved once per connection;
//! a call may then ask to act as someone else, which only administrators
//! are allowed to do.

use crate::error::Result;
use nix::sys::socket::{getsockopt, sockopt};
use nix::unistd::{Group, Uid, User};
use std::os::unix::net::UnixStream;

/// Who is on the other end of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub uid: u32,
    pub user: String,
    pub is_admin: bool,
}

impl PeerIdentity {
    /// Read the peer's credentials from the socket and resolve its account
    pub fn from_stream(stream: &UnixStream, admin_group: &str) -> Result<Self> {
        let creds = getsockopt(stream, sockopt::PeerCredentials).map_err(std::io::Error::from)?;
        Ok(Self::resolve(creds.uid(), admin_group))
    }

    /// Look up the account name and administrative group membership for `uid`
    pub fn resolve(uid: u32, admin_group: &str) -> Self {
        let user = match User::from_uid(Uid::from_raw(uid)) {
            Ok(Some(user)) => user,
            Ok(None) | Err(_) => {
                log::warn!("No account for uid {}, treating as unprivileged", uid);
                return Self {
                    uid,
                    user: uid.to_string(),
                    is_admin: false,
                };
            }
        };

        let is_admin = match Group::from_name(admin_group) {
            Ok(Some(group)) => group.gid == user.gid || group.mem.iter().any(|m| *m == user.name),
            Ok(None) => false,
            Err(e) => {
                log::warn!("Failed to look up group {}: {}", admin_group, e);
                false
            }
        };

        Self {
            uid,
            user: user.name,
            is_admin,
        }
    }
}

/// Authorization for a single call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    /// Account that opened the connection
    pub caller: String,
    /// Uid of the connecting process
    pub caller_uid: u32,
    /// Account the backend operations act on
    pub owner: String,
}

impl AuthContext {
    /// Decide who a call acts as
    ///
    /// Administrators may name another account; for everyone else the
    /// request is ignored and the call acts as the caller.
    pub fn for_call(identity: &PeerIdentity, requested: Option<&str>) -> Self {
        let owner = match requested {
            Some(target) if target != identity.user && identity.is_admin => {
                log::info!("{} is acting as {}", identity.user, target);
                target.to_string()
            }
            Some(target) if target != identity.user => {
                log::warn!(
                    "{} asked to act as {} but is not an administrator",
                    identity.user,
                    target
                );
                identity.user.clone()
            }
            _ => identity.user.clone(),
        };

        Self {
            caller: identity.user.clone(),
            caller_uid: identity.uid,
            owner,
        }
    }

    pub fn is_impersonating(&self) -> bool {
        self.caller != self.owner
    }
}
