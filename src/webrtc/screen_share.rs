//! Screen-share permission negotiation
//!
//! Guests need either the room-wide allow flag or a standing grant from the
//! host before sharing. The host always may share and collects pending
//! requests from guests. The negotiator only answers "may this participant
//! share now"; track replacement happens elsewhere.

use super::session::ParticipantRole;
use super::WebRTCError;
use log::debug;

/// Guest request waiting for the host's decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareRequest {
    pub requester_id: String,
    pub requester_name: String,
}

/// Per-participant screen-share access state
#[derive(Debug, Clone)]
pub struct ScreenShareNegotiator {
    role: ParticipantRole,
    globally_allowed: bool,
    standing_grant: bool,
    pending: Vec<ShareRequest>,
}

impl ScreenShareNegotiator {
    pub fn new(role: ParticipantRole) -> Self {
        Self {
            role,
            globally_allowed: false,
            standing_grant: false,
            pending: Vec::new(),
        }
    }

    pub fn role(&self) -> ParticipantRole {
        self.role
    }

    /// Host side: record a guest's request. Returns the stored request when it
    /// is new, `None` for duplicates or when this participant is not the host.
    pub fn on_share_requested(&mut self, requester_id: &str, requester_name: &str) -> Option<ShareRequest> {
        if self.role != ParticipantRole::Host {
            debug!("Ignoring screen-share request from {} (not host)", requester_id);
            return None;
        }
        if self.pending.iter().any(|r| r.requester_id == requester_id) {
            return None;
        }

        let requester_name = if requester_name.trim().is_empty() {
            format!("User {}", requester_id)
        } else {
            requester_name.to_string()
        };
        let request = ShareRequest {
            requester_id: requester_id.to_string(),
            requester_name,
        };
        self.pending.push(request.clone());
        Some(request)
    }

    /// Host side: remove a request once it has been allowed or denied
    pub fn take_request(&mut self, requester_id: &str) -> Option<ShareRequest> {
        let index = self.pending.iter().position(|r| r.requester_id == requester_id)?;
        Some(self.pending.remove(index))
    }

    pub fn pending_requests(&self) -> &[ShareRequest] {
        &self.pending
    }

    /// Guest side: the host answered our request
    pub fn on_permission_result(&mut self, granted: bool) {
        self.standing_grant = granted;
    }

    /// Room-wide allow flag changed
    pub fn on_access_updated(&mut self, allowed: bool) {
        self.globally_allowed = allowed;
    }

    pub fn is_globally_allowed(&self) -> bool {
        self.globally_allowed
    }

    pub fn has_standing_grant(&self) -> bool {
        self.standing_grant
    }

    pub fn can_share(&self) -> bool {
        self.role == ParticipantRole::Host || self.globally_allowed || self.standing_grant
    }

    /// Gate consulted before any share attempt
    pub fn check_can_share(&self) -> Result<(), WebRTCError> {
        if self.can_share() {
            Ok(())
        } else {
            Err(WebRTCError::ShareNotPermitted)
        }
    }

    /// A share ended: a grant not backed by the room-wide flag is used up
    pub fn on_share_stopped(&mut self) {
        if self.role == ParticipantRole::Guest && !self.globally_allowed {
            self.standing_grant = false;
        }
    }
}
