use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

pub type ParticipantId = String;
pub type GroupId = String;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    #[serde(default)]
    pub wishlist: String,
    #[serde(default)]
    pub joined_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<ParticipantId>,
}

impl Participant {
    pub fn new(id: impl Into<ParticipantId>, name: impl Into<String>, joined_at: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            wishlist: String::new(),
            joined_at,
            assigned_to: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Participant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub role: Role,
}

impl Identity {
    pub fn admin() -> Self {
        Self {
            name: "Admin".to_string(),
            role: Role::Admin,
        }
    }

    pub fn participant(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: Role::Participant,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self.role, Role::Admin)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub participants: Vec<Participant>,
    pub draw_completed: bool,
    pub created_at: u64,
    pub draw_completed_at: Option<u64>,
}

impl Group {
    pub fn new(id: impl Into<GroupId>, name: impl Into<String>, created_at: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            participants: Vec::new(),
            draw_completed: false,
            created_at,
            draw_completed_at: None,
        }
    }

    pub fn participant(&self, participant_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == participant_id)
    }

    pub fn recipient_of(&self, participant_id: &str) -> Option<&Participant> {
        let target = self.participant(participant_id)?.assigned_to.as_deref()?;
        self.participant(target)
    }

    pub fn add_participant(
        &mut self,
        id: impl Into<ParticipantId>,
        name: &str,
        joined_at: u64,
    ) -> Result<Participant, JoinError> {
        let name = normalize_name(name).ok_or(JoinError::EmptyName)?;

        if self.draw_completed {
            return Err(JoinError::DrawCompleted);
        }

        if self.participants.iter().any(|p| names_match(&p.name, &name)) {
            return Err(JoinError::DuplicateName(name));
        }

        let participant = Participant::new(id, name, joined_at);
        self.participants.push(participant.clone());
        Ok(participant)
    }

    pub fn update_wishlist(
        &mut self,
        participant_id: &str,
        wishlist: &str,
    ) -> Result<&Participant, WishlistError> {
        let participant = self
            .participants
            .iter_mut()
            .find(|p| p.id == participant_id)
            .ok_or_else(|| WishlistError::ParticipantNotFound(participant_id.to_string()))?;
        participant.wishlist = wishlist.trim().to_string();
        Ok(participant)
    }

    pub fn draw<R: Rng + ?Sized>(&mut self, rng: &mut R, now: u64) -> Result<Assignment, DrawError> {
        let assignment = compute_assignment(&self.participants, self.draw_completed, rng)?;
        assignment.commit(self, now)?;
        Ok(assignment)
    }

    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if normalize_name(&self.name).is_none() {
            return Err(InvariantViolation::EmptyGroupName);
        }

        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for p in &self.participants {
            if normalize_name(&p.name).is_none() {
                return Err(InvariantViolation::EmptyParticipantName(p.id.clone()));
            }
            if !ids.insert(p.id.as_str()) {
                return Err(InvariantViolation::DuplicateParticipantId(p.id.clone()));
            }
            if !names.insert(p.name.trim().to_lowercase()) {
                return Err(InvariantViolation::DuplicateParticipantName(p.name.clone()));
            }
        }

        if self.draw_completed && self.participants.len() < 2 {
            return Err(InvariantViolation::DrawnWithoutRoster);
        }

        let mut recipients = HashSet::new();
        for p in &self.participants {
            match (&p.assigned_to, self.draw_completed) {
                (None, false) => {}
                (None, true) => return Err(InvariantViolation::MissingAssignment(p.id.clone())),
                (Some(_), false) => {
                    return Err(InvariantViolation::AssignmentBeforeDraw(p.id.clone()))
                }
                (Some(to), true) => {
                    if *to == p.id {
                        return Err(InvariantViolation::SelfAssignment(p.id.clone()));
                    }
                    if !ids.contains(to.as_str()) {
                        return Err(InvariantViolation::UnknownRecipient {
                            participant_id: p.id.clone(),
                            recipient: to.clone(),
                        });
                    }
                    if !recipients.insert(to.as_str()) {
                        return Err(InvariantViolation::RecipientAssignedTwice(to.clone()));
                    }
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssignmentPair {
    pub participant_id: ParticipantId,
    pub assigned_to: ParticipantId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Assignment {
    pairs: Vec<AssignmentPair>,
}

impl Assignment {
    pub fn pairs(&self) -> &[AssignmentPair] {
        &self.pairs
    }

    pub fn into_pairs(self) -> Vec<AssignmentPair> {
        self.pairs
    }

    pub fn recipient_of(&self, participant_id: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|pair| pair.participant_id == participant_id)
            .map(|pair| pair.assigned_to.as_str())
    }

    /// Attaches every assignment and flips `draw_completed`, all or nothing.
    ///
    /// Refuses a group that was drawn in the meantime or whose roster no longer
    /// matches the one this assignment was computed from.
    pub fn commit(&self, group: &mut Group, now: u64) -> Result<(), DrawError> {
        if group.draw_completed {
            return Err(DrawError::AlreadyCompleted);
        }

        let same_roster = group.participants.len() == self.pairs.len()
            && group
                .participants
                .iter()
                .zip(&self.pairs)
                .all(|(p, pair)| p.id == pair.participant_id);
        if !same_roster {
            return Err(DrawError::RosterChanged);
        }

        for (participant, pair) in group.participants.iter_mut().zip(&self.pairs) {
            participant.assigned_to = Some(pair.assigned_to.clone());
        }
        group.draw_completed = true;
        group.draw_completed_at = Some(now);
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DrawError {
    #[error("need at least 2 participants to draw, have {count}")]
    InsufficientParticipants { count: usize },
    #[error("draw already completed")]
    AlreadyCompleted,
    #[error("invalid assignment detected for participant {0}")]
    InvalidAssignmentDetected(ParticipantId),
    #[error("roster changed since the assignment was computed")]
    RosterChanged,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("name required")]
    EmptyName,
    #[error("participant {0} already exists in this group")]
    DuplicateName(String),
    #[error("draw already completed")]
    DrawCompleted,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WishlistError {
    #[error("participant {0} not found")]
    ParticipantNotFound(ParticipantId),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("group name is empty")]
    EmptyGroupName,
    #[error("participant {0} has an empty name")]
    EmptyParticipantName(ParticipantId),
    #[error("participant id {0} appears twice")]
    DuplicateParticipantId(ParticipantId),
    #[error("participant name {0} appears twice")]
    DuplicateParticipantName(String),
    #[error("draw completed with fewer than 2 participants")]
    DrawnWithoutRoster,
    #[error("participant {0} has no assignment after the draw")]
    MissingAssignment(ParticipantId),
    #[error("participant {0} is assigned before the draw")]
    AssignmentBeforeDraw(ParticipantId),
    #[error("participant {0} is assigned to themselves")]
    SelfAssignment(ParticipantId),
    #[error("participant {participant_id} is assigned to unknown {recipient}")]
    UnknownRecipient {
        participant_id: ParticipantId,
        recipient: ParticipantId,
    },
    #[error("recipient {0} is assigned more than once")]
    RecipientAssignedTwice(ParticipantId),
}

pub fn normalize_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn names_match(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

/// Shuffles, then gives each participant to the next one in shuffled order,
/// wrapping around. Nothing is mutated; see [`Assignment::commit`].
pub fn compute_assignment<R: Rng + ?Sized>(
    participants: &[Participant],
    draw_completed: bool,
    rng: &mut R,
) -> Result<Assignment, DrawError> {
    let n = participants.len();
    if n < 2 {
        return Err(DrawError::InsufficientParticipants { count: n });
    }
    if draw_completed {
        return Err(DrawError::AlreadyCompleted);
    }

    let mut shuffled: Vec<&ParticipantId> = participants.iter().map(|p| &p.id).collect();
    shuffled.shuffle(rng);

    let successor: HashMap<&ParticipantId, &ParticipantId> = shuffled
        .iter()
        .enumerate()
        .map(|(k, id)| (*id, shuffled[(k + 1) % n]))
        .collect();

    let pairs = participants
        .iter()
        .map(|p| {
            successor
                .get(&p.id)
                .map(|to| AssignmentPair {
                    participant_id: p.id.clone(),
                    assigned_to: (*to).clone(),
                })
                .ok_or_else(|| DrawError::InvalidAssignmentDetected(p.id.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    verify_derangement(&pairs)?;
    Ok(Assignment { pairs })
}

// Unreachable with the cyclic construction above for distinct ids.
fn verify_derangement(pairs: &[AssignmentPair]) -> Result<(), DrawError> {
    let mut recipients = HashSet::new();
    for pair in pairs {
        if pair.participant_id == pair.assigned_to || !recipients.insert(&pair.assigned_to) {
            return Err(DrawError::InvalidAssignmentDetected(
                pair.participant_id.clone(),
            ));
        }
    }
    Ok(())
}
