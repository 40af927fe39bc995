//! Session context: who we are and what a director has selected.
//!
//! The identity is frozen when the session starts. The selection is only
//! changed through [`SessionContext::set_listen`] and
//! [`SessionContext::set_speak`].

use std::fmt;
use std::str::FromStr;

use pitwall_common::helpers::{is_reserved_team, normalize_team};
use pitwall_common::{Error, Result, Role, BROADCAST_TARGET, NO_TARGET};

/// Local participant identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    role: Role,
    team_id: String,
    display_name: String,
}

impl Identity {
    pub fn new(role: Role, team_id: &str, display_name: &str) -> Result<Self> {
        let team_id = normalize_team(team_id);
        if role == Role::Driver && team_id.is_empty() {
            return Err(Error::config("a driver needs a team identifier"));
        }
        if is_reserved_team(&team_id) {
            return Err(Error::config(format!(
                "team identifier {team_id:?} is reserved"
            )));
        }

        Ok(Self {
            role,
            team_id,
            display_name: display_name.trim().to_string(),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn team_id(&self) -> &str {
        &self.team_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn is_director(&self) -> bool {
        self.role == Role::Director
    }

    /// Address to put in `from` when signaling `remote_id`.
    ///
    /// Drivers always sign with their own team. A director speaks on the
    /// channel of the team it is talking to.
    pub fn signaling_address<'a>(&'a self, remote_id: &'a str) -> &'a str {
        match self.role {
            Role::Driver => &self.team_id,
            Role::Director => remote_id,
        }
    }
}

/// Director listen selector.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ListenTarget {
    #[default]
    All,
    Team(String),
}

impl ListenTarget {
    pub fn includes(&self, team_id: &str) -> bool {
        match self {
            ListenTarget::All => true,
            ListenTarget::Team(team) => team == team_id,
        }
    }
}

impl FromStr for ListenTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let value = normalize_team(s);
        if value.is_empty() {
            return Err(Error::config("listen target is empty"));
        }
        if value.eq_ignore_ascii_case(BROADCAST_TARGET) {
            return Ok(ListenTarget::All);
        }
        if value.eq_ignore_ascii_case(NO_TARGET) {
            return Err(Error::config("listen target cannot be \"none\""));
        }
        Ok(ListenTarget::Team(value))
    }
}

impl fmt::Display for ListenTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenTarget::All => f.write_str(BROADCAST_TARGET),
            ListenTarget::Team(team) => f.write_str(team),
        }
    }
}

/// Director speak selector.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SpeakTarget {
    #[default]
    None,
    All,
    Team(String),
}

impl SpeakTarget {
    pub fn includes(&self, team_id: &str) -> bool {
        match self {
            SpeakTarget::None => false,
            SpeakTarget::All => true,
            SpeakTarget::Team(team) => team == team_id,
        }
    }
}

impl FromStr for SpeakTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let value = normalize_team(s);
        if value.is_empty() {
            return Err(Error::config("speak target is empty"));
        }
        if value.eq_ignore_ascii_case(BROADCAST_TARGET) {
            Ok(SpeakTarget::All)
        } else if value.eq_ignore_ascii_case(NO_TARGET) {
            Ok(SpeakTarget::None)
        } else {
            Ok(SpeakTarget::Team(value))
        }
    }
}

impl fmt::Display for SpeakTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeakTarget::None => f.write_str(NO_TARGET),
            SpeakTarget::All => f.write_str(BROADCAST_TARGET),
            SpeakTarget::Team(team) => f.write_str(team),
        }
    }
}

/// Director-only listen/speak selection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoutingSelection {
    pub listen: ListenTarget,
    pub speak: SpeakTarget,
}

/// Identity plus selection, handed to every routing decision.
#[derive(Debug, Clone)]
pub struct SessionContext {
    identity: Identity,
    selection: RoutingSelection,
}

impl SessionContext {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            selection: RoutingSelection::default(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn selection(&self) -> &RoutingSelection {
        &self.selection
    }

    pub fn set_listen(&mut self, target: ListenTarget) -> Result<()> {
        self.require_director("listen")?;
        self.selection.listen = target;
        Ok(())
    }

    pub fn set_speak(&mut self, target: SpeakTarget) -> Result<()> {
        self.require_director("speak")?;
        self.selection.speak = target;
        Ok(())
    }

    /// Signaling filter on the `to` field.
    ///
    /// Directors hear every envelope on the relay; everyone else only their
    /// own team address and the broadcast address.
    pub fn accepts_address(&self, to: &str) -> bool {
        self.identity.is_director() || to == self.identity.team_id || to == BROADCAST_TARGET
    }

    fn require_director(&self, selector: &str) -> Result<()> {
        if self.identity.is_director() {
            Ok(())
        } else {
            Err(Error::config(format!(
                "only a director can change the {selector} selection"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(team: &str) -> SessionContext {
        SessionContext::new(Identity::new(Role::Driver, team, "Lando").unwrap())
    }

    fn director() -> SessionContext {
        SessionContext::new(Identity::new(Role::Director, "", "Race Control").unwrap())
    }

    #[test]
    fn test_driver_requires_team() {
        assert!(Identity::new(Role::Driver, "  ", "x").is_err());
        assert!(Identity::new(Role::Driver, "all", "x").is_err());
        assert!(Identity::new(Role::Director, "", "x").is_ok());
    }

    #[test]
    fn test_director_defaults() {
        let ctx = director();
        assert_eq!(ctx.selection().listen, ListenTarget::All);
        assert_eq!(ctx.selection().speak, SpeakTarget::None);
    }

    #[test]
    fn test_driver_cannot_select() {
        let mut ctx = driver("redteam");
        assert!(ctx.set_listen(ListenTarget::All).is_err());
        assert!(ctx.set_speak(SpeakTarget::All).is_err());
        assert_eq!(ctx.selection(), &RoutingSelection::default());
    }

    #[test]
    fn test_address_filter() {
        let ctx = driver("redteam");
        assert!(ctx.accepts_address("redteam"));
        assert!(ctx.accepts_address("all"));
        assert!(!ctx.accepts_address("blueteam"));

        let ctx = director();
        assert!(ctx.accepts_address("blueteam"));
        assert!(ctx.accepts_address("redteam"));
    }

    #[test]
    fn test_signaling_address() {
        let ctx = driver("redteam");
        assert_eq!(ctx.identity().signaling_address("blueteam"), "redteam");

        let ctx = director();
        assert_eq!(ctx.identity().signaling_address("blueteam"), "blueteam");
    }

    #[test]
    fn test_selector_parsing() {
        assert_eq!("ALL".parse::<ListenTarget>().unwrap(), ListenTarget::All);
        assert_eq!(
            " redteam ".parse::<ListenTarget>().unwrap(),
            ListenTarget::Team("redteam".into())
        );
        assert!("none".parse::<ListenTarget>().is_err());
        assert_eq!("none".parse::<SpeakTarget>().unwrap(), SpeakTarget::None);
        assert_eq!("all".parse::<SpeakTarget>().unwrap(), SpeakTarget::All);
        assert_eq!(SpeakTarget::Team("blueteam".into()).to_string(), "blueteam");
    }
}
