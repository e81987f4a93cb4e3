//! The command language the CLI speaks.
//!
//! ```text
//! cadence run driver=diag op=x cycles=10K threads=auto \
//!         start alias=bg driver=diag op=y cycles=1M cyclerate=100 \
//!         waitmillis 500 set bg cyclerate=500 stop bg
//! ```
//!
//! A command word ends the previous command's parameters. Parameters before
//! any command word form an implicit `run`.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;

use super::{ControlProcedure, ScenarioController};
use crate::{
    error::{Error, Result},
    params::{ActivityDef, ParameterMap, tokenize, unquote},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run(ParameterMap),
    Start(ParameterMap),
    Stop(String),
    ForceStop(String),
    Await(String),
    AwaitAll,
    WaitMillis(u64),
    Set {
        alias: String,
        key: String,
        value: String,
    },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Run(params) => write!(f, "run {params}"),
            Command::Start(params) => write!(f, "start {params}"),
            Command::Stop(pattern) => write!(f, "stop {pattern}"),
            Command::ForceStop(pattern) => write!(f, "forcestop {pattern}"),
            Command::Await(alias) => write!(f, "await {alias}"),
            Command::AwaitAll => f.write_str("awaitall"),
            Command::WaitMillis(ms) => write!(f, "waitmillis {ms}"),
            Command::Set { alias, key, value } => write!(f, "set {alias} {key}={value}"),
        }
    }
}

fn script_error(token: &str, reason: &str) -> Error {
    Error::invalid("command", token, reason)
}

fn param(params: &mut ParameterMap, token: &str) -> Result<()> {
    match token.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            params.set(key.trim(), unquote(value.trim()));
            Ok(())
        }
        _ => Err(script_error(token, "expected key=value")),
    }
}

fn next_arg<'a>(iter: &mut impl Iterator<Item = &'a str>, word: &str) -> Result<String> {
    iter.next()
        .map(unquote)
        .ok_or_else(|| script_error(word, "missing argument"))
}

/// A control procedure made of commands, run in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandScript {
    commands: Vec<Command>,
    timeout: Duration,
}

impl CommandScript {
    /// Parses already-split words, as they come from the command line.
    pub fn parse<I, S>(words: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let words: Vec<String> = words.into_iter().map(|w| w.as_ref().to_string()).collect();
        let mut commands = Vec::new();
        let mut iter = words.iter().map(String::as_str).peekable();
        while let Some(word) = iter.next() {
            let command = match word {
                "run" | "start" => {
                    let mut params = ParameterMap::new();
                    while let Some(token) = iter.next_if(|t| t.contains('=')) {
                        param(&mut params, token)?;
                    }
                    if word == "run" {
                        Command::Run(params)
                    } else {
                        Command::Start(params)
                    }
                }
                "stop" => Command::Stop(next_arg(&mut iter, word)?),
                "forcestop" => Command::ForceStop(next_arg(&mut iter, word)?),
                "await" => Command::Await(next_arg(&mut iter, word)?),
                "awaitall" => Command::AwaitAll,
                "waitmillis" => {
                    let ms = next_arg(&mut iter, word)?;
                    Command::WaitMillis(
                        ms.parse()
                            .map_err(|_| script_error(&ms, "expected milliseconds"))?,
                    )
                }
                "set" => {
                    let alias = next_arg(&mut iter, word)?;
                    let assignment = next_arg(&mut iter, word)?;
                    let Some((key, value)) = assignment.split_once('=') else {
                        return Err(script_error(&assignment, "expected key=value"));
                    };
                    Command::Set {
                        alias,
                        key: key.trim().to_string(),
                        value: unquote(value.trim()),
                    }
                }
                token if token.contains('=') => {
                    let mut params = ParameterMap::new();
                    param(&mut params, token)?;
                    while let Some(token) = iter.next_if(|t| t.contains('=')) {
                        param(&mut params, token)?;
                    }
                    Command::Run(params)
                }
                other => return Err(script_error(other, "unknown command")),
            };
            commands.push(command);
        }
        Ok(Self {
            commands,
            timeout: Duration::MAX,
        })
    }

    /// Parses a script file: words separated by whitespace or `;`, values
    /// quoted when they contain either, `#` starting a comment line.
    pub fn from_text(text: &str) -> Result<Self> {
        let mut words = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            words.extend(tokenize(line)?);
        }
        Self::parse(words)
    }

    /// Bounds every `run`, `await` and `awaitall`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn extend(&mut self, other: CommandScript) {
        self.commands.extend(other.commands);
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[async_trait]
impl ControlProcedure for CommandScript {
    async fn run(&self, c: Arc<ScenarioController>) -> Result<()> {
        for command in &self.commands {
            tracing::info!("{}: {command}", c.name());
            match command {
                Command::Run(params) => {
                    c.run(ActivityDef::from_params(params.clone()), self.timeout)
                        .await?;
                }
                Command::Start(params) => {
                    c.start(ActivityDef::from_params(params.clone())).await?;
                }
                Command::Stop(pattern) => c.stop(pattern).await?,
                Command::ForceStop(pattern) => {
                    c.force_stop(pattern, c.config().force_stop_grace).await?
                }
                Command::Await(alias) => {
                    c.await_activity(alias, self.timeout).await?;
                }
                Command::AwaitAll => c.await_completion(self.timeout).await?,
                Command::WaitMillis(ms) => c.wait_millis(*ms).await,
                Command::Set { alias, key, value } => c.set_param(alias, key, value).await?,
            }
        }
        Ok(())
    }
}
