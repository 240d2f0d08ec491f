//! Participant roster and role derivation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Permission level of a participant within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Owner,
    CollaboratorFull,
    CollaboratorReview,
    Viewer,
}

impl Role {
    /// Map a wire role string. Unknown strings yield `None`, never a guess.
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "owner" => Some(Role::Owner),
            "collaborator-full" => Some(Role::CollaboratorFull),
            "collaborator-review" => Some(Role::CollaboratorReview),
            "viewer" => Some(Role::Viewer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::CollaboratorFull => "collaborator-full",
            Role::CollaboratorReview => "collaborator-review",
            Role::Viewer => "viewer",
        }
    }

    pub fn is_owner(&self) -> bool {
        matches!(self, Role::Owner)
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, Role::Viewer | Role::CollaboratorReview)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One roster entry as the signaling service reports it.
///
/// `role` stays a raw string so that a role this build does not know about
/// survives a round trip and simply derives to no role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    #[serde(alias = "id")]
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub role: String,
}

impl Participant {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            role: role.into(),
        }
    }

    pub fn role(&self) -> Option<Role> {
        Role::parse(&self.role)
    }
}

/// The caller's role: its own roster entry, looked up by id.
pub fn derive_role(participants: &[Participant], user_id: &str) -> Option<Role> {
    participants
        .iter()
        .find(|p| p.user_id == user_id)
        .and_then(Participant::role)
}

/// Insert or replace by `user_id`, keeping roster order stable.
pub(crate) fn upsert(participants: &mut Vec<Participant>, participant: Participant) {
    match participants.iter_mut().find(|p| p.user_id == participant.user_id) {
        Some(existing) => *existing = participant,
        None => participants.push(participant),
    }
}
