//! Metadata script runner
//!
//! Executes the user-provided scripts attached to an instance for the
//! sysprep-specialize, startup and shutdown hooks. Script bodies can be
//! embedded directly in metadata attributes or referenced by URL;
//! either way they are staged to a temp directory, run through the
//! interpreter their suffix selects, and their output forwarded to the
//! log line by line.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use guest_core::metadata::{fetch_attributes, METADATA_URL};
use guest_core::script::{self, ScriptType};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const COMMANDS: [&str; 3] = ["specialize", "startup", "shutdown"];

// Within the chosen attributes map, scripts run in this fixed order.
const SUFFIX_ORDER: [&str; 4] = ["ps1", "cmd", "bat", "url"];

/// One script found in metadata: the attribute key it came from, the
/// key suffix that selected it, and the body or URL it holds.
#[derive(Debug, Clone, PartialEq)]
struct MetadataScript {
    key: String,
    suffix: &'static str,
    value: String,
}

/// Maps the command argument to its attribute key prefix.
fn key_prefix(command: &str) -> Result<String> {
    if !COMMANDS.contains(&command) {
        bail!("no valid arguments specified, options: {}", COMMANDS.join("|"));
    }
    Ok(if command == "specialize" {
        format!("sysprep-{command}")
    } else {
        format!("windows-{command}")
    })
}

fn validate_args(args: &[String]) -> Result<&str> {
    if args.len() != 2 {
        bail!("no valid arguments specified, options: {}", COMMANDS.join("|"));
    }
    let command = args[1].as_str();
    key_prefix(command)?;
    Ok(command)
}

/// Picks the matching scripts out of one attributes map, in run order.
fn select_scripts(prefix: &str, attributes: &HashMap<String, String>) -> Vec<MetadataScript> {
    SUFFIX_ORDER
        .iter()
        .filter_map(|suffix| {
            let key = format!("{prefix}-script-{suffix}");
            attributes
                .get(&key)
                .filter(|value| !value.is_empty())
                .map(|value| MetadataScript {
                    key,
                    suffix,
                    value: value.clone(),
                })
        })
        .collect()
}

/// Instance attributes win outright: when any matching key is present
/// there, the project attributes are never consulted.
async fn get_scripts(base_url: &str, prefix: &str) -> Result<Vec<MetadataScript>> {
    let instance = fetch_attributes(base_url, "instance")
        .await
        .context("fetching instance attributes")?;
    let scripts = select_scripts(prefix, &instance);
    if !scripts.is_empty() {
        return Ok(scripts);
    }
    let project = fetch_attributes(base_url, "project")
        .await
        .context("fetching project attributes")?;
    Ok(select_scripts(prefix, &project))
}

/// The interpreter for a URL-delivered script, chosen by the URL's
/// path suffix.
fn url_script_type(url: &str) -> Result<ScriptType> {
    let suffix = url.rsplit('.').next().unwrap_or("");
    ScriptType::from_suffix(suffix)
        .with_context(|| format!("unknown script type in url path: {url:?}"))
}

/// Stages and runs one script, returning its exit code.
async fn run_script(ms: &MetadataScript) -> Result<i32> {
    let dir = tempfile::tempdir().context("creating staging directory")?;
    let (kind, staged) = if ms.suffix == "url" {
        let kind = url_script_type(&ms.value)?;
        let staged = dir.path().join(format!("{}.{}", ms.key, kind.extension()));
        script::fetch_to(&ms.value, &staged).await?;
        (kind, staged)
    } else {
        let kind = ScriptType::from_suffix(ms.suffix).expect("selected by known suffix");
        let staged = script::stage(dir.path(), &ms.key, kind.extension(), &ms.value)?;
        (kind, staged)
    };
    script::run_command(kind.command(&staged), &ms.key, None).await
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let command = match validate_args(&args) {
        Ok(command) => command,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    let prefix = key_prefix(command).expect("validated above");

    info!("starting {command} scripts");
    let scripts = match get_scripts(METADATA_URL, &prefix).await {
        Ok(scripts) => scripts,
        Err(err) => {
            error!("getting {command} scripts: {err:#}");
            std::process::exit(1);
        }
    };
    if scripts.is_empty() {
        info!("no {command} scripts to run");
        return;
    }

    for ms in &scripts {
        info!("found {} in metadata", ms.key);
        match run_script(ms).await {
            Ok(code) => info!("{} exit status {code}", ms.key),
            Err(err) => error!("{}: {err:#}", ms.key),
        }
    }
    info!("finished running {command} scripts");
}
