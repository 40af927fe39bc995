//! Line-oriented console front-end.
//!
//! A terminal has no key-release events, so the talk key is a toggle (`t`)
//! or explicit `down` / `up`.

use std::fmt;

use pitwall_common::{Error, Result};
use pitwall_radio::{EngineHandle, EngineSnapshot, ListenTarget, SpeakTarget, TalkKeyState};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

pub const HELP: &str = "\
commands:
  t                      toggle the talk key
  down | up              press / release the talk key
  listen <team|all>      director: choose who you hear
  speak <team|all|none>  director: choose who hears you
  status                 show connections and who is on air
  help                   show this text
  quit                   leave the radio";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Toggle,
    KeyDown,
    KeyUp,
    Listen(ListenTarget),
    Speak(SpeakTarget),
    Status,
    Help,
    Quit,
}

impl Command {
    /// `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let argument = words.collect::<Vec<_>>().join(" ");

        let command = match verb.to_ascii_lowercase().as_str() {
            "t" | "talk" => Command::Toggle,
            "down" => Command::KeyDown,
            "up" => Command::KeyUp,
            "listen" => Command::Listen(require_argument(verb, &argument)?.parse()?),
            "speak" => Command::Speak(require_argument(verb, &argument)?.parse()?),
            "status" | "s" => Command::Status,
            "help" | "?" => Command::Help,
            "quit" | "q" | "exit" => Command::Quit,
            other => return Err(Error::config(format!("unknown command {other:?}"))),
        };
        Ok(Some(command))
    }
}

fn require_argument<'a>(verb: &str, argument: &'a str) -> Result<&'a str> {
    if argument.is_empty() {
        Err(Error::config(format!("{verb} needs a team, or all")))
    } else {
        Ok(argument)
    }
}

/// Human readable status block.
pub struct StatusReport<'a>(pub &'a EngineSnapshot);

impl fmt::Display for StatusReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.0;
        write!(f, "{} ", snapshot.role)?;
        if !snapshot.team_id.is_empty() {
            write!(f, "{} ", snapshot.team_id)?;
        }
        writeln!(f, "(session {})", snapshot.session_id)?;
        writeln!(
            f,
            "listen {}  speak {}  talk key {}",
            snapshot.selection.listen,
            snapshot.selection.speak,
            match snapshot.talk_key {
                TalkKeyState::Idle => "up",
                TalkKeyState::Cueing(_) => "cueing",
                TalkKeyState::Transmitting(_) => "TRANSMITTING",
            }
        )?;
        if snapshot.peers.is_empty() {
            writeln!(f, "no connections")?;
        }
        for peer in &snapshot.peers {
            writeln!(
                f,
                "  {:<16} {:<16} {:<18} link {:?}{}",
                peer.remote_id,
                peer.remote_name,
                peer.state,
                peer.link,
                if peer.attached { "  [sending]" } else { "" }
            )?;
        }
        if snapshot.presenting.is_empty() {
            write!(f, "on air: nobody")
        } else {
            write!(f, "on air: {}", snapshot.presenting.join(", "))
        }
    }
}

/// Applies console commands to the engine.
pub struct Console {
    handle: EngineHandle,
    talking: bool,
}

impl Console {
    pub fn new(handle: EngineHandle) -> Self {
        Self {
            handle,
            talking: false,
        }
    }

    /// Returns `false` on quit.
    pub async fn execute(&mut self, command: Command) -> Result<bool> {
        match command {
            Command::Toggle => {
                if self.talking {
                    self.key_up()?;
                } else {
                    self.key_down()?;
                }
            }
            Command::KeyDown => self.key_down()?,
            Command::KeyUp => self.key_up()?,
            Command::Listen(target) => self.handle.set_listen(target).await?,
            Command::Speak(target) => self.handle.set_speak(target).await?,
            Command::Status => {
                let snapshot = self.handle.snapshot().await?;
                println!("{}", StatusReport(&snapshot));
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => return Ok(false),
        }
        Ok(true)
    }

    fn key_down(&mut self) -> Result<()> {
        self.talking = true;
        self.handle.talk_key_down()?;
        info!("talk key down");
        Ok(())
    }

    fn key_up(&mut self) -> Result<()> {
        self.talking = false;
        self.handle.talk_key_up()?;
        info!("talk key up");
        Ok(())
    }

    /// Read stdin until `quit` or end of input.
    pub async fn run(mut self) -> Result<()> {
        println!("{HELP}");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let command = match Command::parse(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(e) => {
                    warn!("{}", e);
                    continue;
                }
            };
            match self.execute(command).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) if matches!(e, Error::Config(_)) => warn!("{}", e),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_talk_key() {
        assert_eq!(Command::parse("t").unwrap(), Some(Command::Toggle));
        assert_eq!(Command::parse("  DOWN ").unwrap(), Some(Command::KeyDown));
        assert_eq!(Command::parse("up").unwrap(), Some(Command::KeyUp));
        assert_eq!(Command::parse("   ").unwrap(), None);
    }

    #[test]
    fn test_parse_selectors() {
        assert_eq!(
            Command::parse("listen redteam").unwrap(),
            Some(Command::Listen(ListenTarget::Team("redteam".into())))
        );
        assert_eq!(
            Command::parse("listen ALL").unwrap(),
            Some(Command::Listen(ListenTarget::All))
        );
        assert_eq!(
            Command::parse("speak none").unwrap(),
            Some(Command::Speak(SpeakTarget::None))
        );
        assert!(Command::parse("listen none").is_err());
        assert!(Command::parse("speak").is_err());
    }

    #[test]
    fn test_unknown_command() {
        assert!(matches!(Command::parse("box box"), Err(Error::Config(_))));
    }
}
