//! Playback engine owning the single audio output.
//!
//! At most one announcement plays at any instant. A request that arrives
//! while the slot is taken is rejected straight away instead of being queued:
//! overlapping announcements are noise, and a late one is worse than none.
//!
//! Audio is rendered by an external program behind the [`Player`] trait. Each
//! playback is bounded by a wall-clock ceiling, after which the program is
//! killed and the slot released.
//!
//! # Example
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//! use chime::{catalog::Catalog, player::{Engine, ProcessPlayer}};
//!
//! # async fn example() -> chime::error::Result<()> {
//! let catalog = Catalog::open("audio")?;
//! let engine = Engine::new(catalog, Arc::new(ProcessPlayer::default()), Duration::from_secs(30));
//! let job = engine.play("bell.mp3").await?;
//! println!("{} finished as {}", job.audio, job.state);
//! # Ok(())
//! # }
//! ```

use std::{
    fmt, io,
    path::Path,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    catalog::Catalog,
    error::{Error, Result},
};

/// Failure of a single playback attempt.
#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("no audio player available")]
    NoPlayer,

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}")]
    Exited {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Renders one audio file to the speaker and returns when it is done.
#[async_trait]
pub trait Player: Send + Sync {
    async fn play(&self, path: &Path) -> std::result::Result<(), PlaybackError>;
}

/// One external program invocation; the audio file path is appended to
/// `args`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "Vec<String>")]
pub struct PlayerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl PlayerCommand {
    pub fn new<S: Into<String>>(program: S, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|&arg| arg.to_owned()).collect(),
        }
    }
}

impl From<Vec<String>> for PlayerCommand {
    fn from(mut argv: Vec<String>) -> Self {
        let program = if argv.is_empty() {
            String::new()
        } else {
            argv.remove(0)
        };

        Self {
            program,
            args: argv,
        }
    }
}

impl fmt::Display for PlayerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Plays audio through the first available command-line player.
///
/// Commands are tried in order. One whose executable cannot be found is
/// skipped; any other outcome of the first command that starts is final.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessPlayer {
    commands: Vec<PlayerCommand>,
}

impl ProcessPlayer {
    #[must_use]
    pub fn new(commands: Vec<PlayerCommand>) -> Self {
        Self { commands }
    }

    #[must_use]
    pub fn commands(&self) -> &[PlayerCommand] {
        &self.commands
    }
}

impl Default for ProcessPlayer {
    /// `omxplayer` on older Raspberry Pi images, then `mpg123`, then `aplay`
    /// for WAV files.
    fn default() -> Self {
        Self::new(vec![
            PlayerCommand::new("omxplayer", &["-o", "local"]),
            PlayerCommand::new("mpg123", &["-q"]),
            PlayerCommand::new("aplay", &["-q"]),
        ])
    }
}

#[async_trait]
impl Player for ProcessPlayer {
    async fn play(&self, path: &Path) -> std::result::Result<(), PlaybackError> {
        let mut last_failure = None;

        for command in &self.commands {
            if command.program.is_empty() {
                continue;
            }

            trace!("spawning {command} {}", path.display());
            let output = tokio::process::Command::new(&command.program)
                .args(&command.args)
                .arg(path)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output()
                .await;

            match output {
                Ok(output) if output.status.success() => return Ok(()),
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
                    debug!(
                        "{} exited with {}, trying next player",
                        command.program, output.status
                    );
                    if !stderr.is_empty() {
                        debug!("{} output: {stderr}", command.program);
                    }
                    last_failure = Some(PlaybackError::Exited {
                        program: command.program.clone(),
                        status: output.status,
                        stderr,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("{} not installed, trying next player", command.program);
                }
                Err(source) => {
                    return Err(PlaybackError::Spawn {
                        program: command.program.clone(),
                        source,
                    });
                }
            }
        }

        Err(last_failure.unwrap_or(PlaybackError::NoPlayer))
    }
}

/// Lifecycle of an accepted announcement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Playing,
    Completed,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Playing => write!(f, "playing"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// Record of a single accepted announcement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Job {
    pub id: Uuid,
    pub audio: String,
    pub accepted_at: OffsetDateTime,
    pub state: JobState,

    /// Short description of why the job failed, safe to show to a client.
    pub diagnostic: Option<String>,
}

impl Job {
    fn new(audio: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            audio: audio.to_owned(),
            accepted_at: OffsetDateTime::now_utc(),
            state: JobState::Queued,
            diagnostic: None,
        }
    }

    fn transition(&mut self, state: JobState) {
        debug!("job {} ({}): {} -> {state}", self.id, self.audio, self.state);
        self.state = state;
    }

    fn fail(&mut self, diagnostic: String) {
        self.diagnostic = Some(diagnostic);
        self.transition(JobState::Failed);
    }
}

/// Serializes playback onto the single audio output.
pub struct Engine {
    catalog: Catalog,
    player: Arc<dyn Player>,
    slot: Arc<Mutex<()>>,
    max_duration: Duration,
}

impl Engine {
    #[must_use]
    pub fn new(catalog: Catalog, player: Arc<dyn Player>, max_duration: Duration) -> Self {
        Self {
            catalog,
            player,
            slot: Arc::new(Mutex::new(())),
            max_duration,
        }
    }

    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Whether an announcement is currently playing.
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.slot.try_lock().is_err()
    }

    /// Plays `audio` and waits for it to finish.
    ///
    /// Once accepted, playback runs on its own task: dropping the returned
    /// future, for instance because the HTTP client went away, does not stop
    /// the announcement.
    ///
    /// # Errors
    ///
    /// * `InvalidArgument` or `NotFound` if `audio` does not resolve to a
    ///   catalog file; the slot is not touched
    /// * `Aborted` if another announcement is playing
    ///
    /// A player failure or timeout is not an error: it is reported as a
    /// [`JobState::Failed`] job.
    pub async fn play(&self, audio: &str) -> Result<Job> {
        let path = self.catalog.resolve(audio).await?;
        let mut job = Job::new(audio);

        let Ok(slot) = Arc::clone(&self.slot).try_lock_owned() else {
            warn!("rejecting {audio}: another announcement is playing");
            return Err(Error::aborted("another announcement is playing"));
        };

        let player = Arc::clone(&self.player);
        let max_duration = self.max_duration;

        let task = tokio::spawn(async move {
            // Released on every exit path, including panics in the player.
            let _slot = slot;

            job.transition(JobState::Playing);
            match tokio::time::timeout(max_duration, player.play(&path)).await {
                Ok(Ok(())) => job.transition(JobState::Completed),
                Ok(Err(e)) => {
                    warn!("playing {} failed: {e}", job.audio);
                    job.fail(e.to_string());
                }
                Err(_) => {
                    warn!(
                        "playing {} exceeded {:.1}s, player killed",
                        job.audio,
                        max_duration.as_secs_f32()
                    );
                    job.fail(format!(
                        "playback exceeded {:.1}s",
                        max_duration.as_secs_f32()
                    ));
                }
            }

            job
        });

        match task.await {
            Ok(job) => Ok(job),
            Err(e) => {
                error!("playing {audio} failed: {e}");
                let mut job = Job::new(audio);
                job.fail(String::from("player crashed"));
                Ok(job)
            }
        }
    }
}
