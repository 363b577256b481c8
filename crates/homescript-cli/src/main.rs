use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use homescript_host::loader::discover_sources;
use homescript_host::{
    build_event_schema, HostConfig, ScriptLoader, ScriptSource, TomlScriptLoader,
};
use homescript_runner::{init_logging, EventBus, HostRunner};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

mod builtins;

#[derive(Parser)]
#[command(name = "homescript", version, author, about, long_about = None)]
pub struct Cli {
    /// Config file to use instead of the default location
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load scripts and publish events read from stdin
    Run {
        /// Directory to load scripts from
        #[arg(long)]
        script_dir: Option<PathBuf>,

        /// Also write logs to the data directory
        #[arg(long)]
        log_file: bool,
    },
    /// Parse every script and report problems without running anything
    Check {
        /// Directory to check
        #[arg(long)]
        script_dir: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<HostConfig> {
    let config = match path {
        Some(path) => HostConfig::load_from(path)?,
        None => HostConfig::load_or_default()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Run {
            script_dir,
            log_file,
        } => {
            if script_dir.is_some() {
                config.scripting.script_dir = script_dir;
            }
            let _guard = init_logging("homescript", log_file || config.log_to_file)
                .context("failed to set up logging")?;
            run(config).await
        }
        Command::Check { script_dir } => {
            if script_dir.is_some() {
                config.scripting.script_dir = script_dir;
            }
            let _guard = init_logging("homescript", false).context("failed to set up logging")?;
            check(config)
        }
    }
}

async fn run(config: HostConfig) -> anyhow::Result<()> {
    let states = builtins::StateStore::default();
    let loader =
        TomlScriptLoader::new(builtins::vocabulary(&states)).with_scripts(builtins::scripts());
    let loaders: Vec<Arc<dyn ScriptLoader>> = vec![Arc::new(loader)];

    let bus = EventBus::default();
    let runner = HostRunner::new(config.scripting, bus.clone(), loaders)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut host = tokio::spawn(runner.run(shutdown_rx));

    info!("Reading events from stdin (e.g. 'motion', 'state light.kitchen off on')");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    info!("End of input");
                    break;
                };
                match builtins::parse_event_line(&line) {
                    Ok(Some(event)) => {
                        states.observe(&event);
                        let delivered = bus.publish(event);
                        if delivered == 0 {
                            info!(target: "events", "No rules listen for that event");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("{:#}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            result = &mut host => {
                result??;
                return Ok(());
            }
        }
    }

    let _ = shutdown_tx.send(true);
    host.await??;
    info!("Shut down");
    Ok(())
}

fn check(config: HostConfig) -> anyhow::Result<()> {
    let states = builtins::StateStore::default();
    let scripts = builtins::scripts();
    let loader = TomlScriptLoader::new(builtins::vocabulary(&states));
    let loaders: Vec<Arc<dyn ScriptLoader>> = vec![Arc::new(loader.clone())];

    let dir = config.scripting.script_dir();
    let paths = discover_sources(&dir, &loaders, &config.scripting.config);
    if paths.is_empty() {
        println!("No scripts found in {}", dir.display());
        return Ok(());
    }

    let mut failures = 0;
    for path in paths {
        let checked = ScriptSource::read(&path)
            .and_then(|source| loader.parse(&source))
            .map_err(anyhow::Error::from)
            .and_then(|parsed| {
                if let Some(name) = &parsed.script {
                    if scripts.create(name).is_none() {
                        bail!("unknown native script '{}'", name);
                    }
                }
                let script = parsed.script.clone();
                Ok((script, build_event_schema(parsed.schema)?))
            });

        match checked {
            Ok((script, schema)) => {
                println!("ok      {}", path.display());
                if let Some(script) = script {
                    println!("  native script: {}", script);
                }
                for line in schema.to_string().lines() {
                    println!("  {}", line);
                }
            }
            Err(e) => {
                failures += 1;
                println!("error   {}: {:#}", path.display(), e);
            }
        }
    }

    if failures > 0 {
        bail!("{} script(s) failed to check", failures);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_metadata() {
        let command = Cli::command();
        command.clone().debug_assert();
        assert_eq!(command.get_author(), Some("The homescript developers"));
    }

    #[test]
    fn test_check_takes_script_dir() {
        let cli = Cli::try_parse_from(["homescript", "check", "--script-dir", "demos/scripts"])
            .expect("arguments should parse");
        match cli.command {
            Command::Check { script_dir } => {
                assert_eq!(script_dir, Some(PathBuf::from("demos/scripts")));
            }
            Command::Run { .. } => panic!("expected the check command"),
        }
    }
}
