use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;

use crate::model::{CatalogItem, Command, VideoRequest};

#[derive(Parser)]
#[command(name = "castsync")]
#[command(version)]
#[command(about = "Drive a remote video player through a shared room: commands in, state out")]
pub struct Args {
    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Mode,
}

#[derive(Subcommand)]
pub enum Mode {
    /// Run an in-process player and controller and apply ACTIONS in order
    Demo {
        /// Room code to create the room under instead of a random one
        #[arg(long)]
        code: Option<String>,

        /// Actions, e.g. add:ID:TITLE now:ID:TITLE play pause skip:2 clear
        #[arg(required = true)]
        actions: Vec<DemoAction>,
    },
    /// Print the effective configuration as TOML
    Config,
}

/// One step of the demo script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoAction(pub Command);

impl FromStr for DemoAction {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut parts = raw.splitn(3, ':');
        let verb = parts.next().unwrap_or_default().to_ascii_lowercase();
        let arg = parts.next();
        let rest = parts.next();

        let video = || -> Result<CatalogItem, String> {
            let id = arg.filter(|s| !s.is_empty()).ok_or_else(|| format!("'{raw}' needs a video id"))?;
            Ok(CatalogItem::new(id, rest.unwrap_or(id)))
        };
        let index = || -> Result<usize, String> {
            arg.ok_or_else(|| format!("'{raw}' needs an index"))?
                .parse::<usize>()
                .map_err(|e| format!("'{raw}': {e}"))
        };

        let cmd = match verb.as_str() {
            "add" => Command::AddToQueue(VideoRequest::new(video()?)),
            "now" => Command::PlayNow(VideoRequest::new(video()?)),
            "next" => Command::PlayNext(VideoRequest::new(video()?)),
            "play" => Command::Play,
            "pause" => Command::Pause,
            "fwd" => Command::Next,
            "back" => Command::Previous,
            "skip" => Command::SkipTo(index()?),
            "mute" => Command::Mute,
            "unmute" => Command::Unmute,
            "toggle-mute" => Command::ToggleMute,
            "remove" => Command::RemoveAt(index()?),
            "up" => Command::MoveUp(index()?),
            "down" => Command::MoveDown(index()?),
            "clear" => Command::ClearQueue,
            other => return Err(format!("unknown action '{other}'")),
        };
        Ok(DemoAction(cmd))
    }
}
