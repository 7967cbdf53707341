// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! amdr - asynchronous AMD module loader
//!
//! Command line front end for `amdr-loader`:
//!
//! - `amdr resolve` shows how names map to module ids and URLs
//! - `amdr load` runs a manifest-described module world and prints values

mod manifest;

use amdr_loader::module_system::{name_to_url, normalize};
use amdr_loader::{Config, Loader, LoaderConfig, TextPlugin, VERSION, Value};
use clap::{Parser, Subcommand};
use manifest::Manifest;
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "amdr",
    about = "Asynchronous AMD module loader",
    version = VERSION,
    author = "Pegasus Heavy Industries"
)]
struct Cli {
    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the canonical id and URL of module names
    Resolve {
        /// Loader configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Module names
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Load modules described by a manifest and print their values
    Load {
        /// Manifest file (JSON)
        manifest: PathBuf,

        /// Module ids to require
        #[arg(required = true)]
        ids: Vec<String>,

        /// Give up after this many seconds, even if the watchdog is disabled
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("amdr_loader=debug")
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("amdr_loader=warn")
            .with_writer(std::io::stderr)
            .init();
    }

    let result = match cli.command {
        Commands::Resolve { config, names } => run_resolve(config.as_deref(), &names),
        Commands::Load {
            manifest,
            ids,
            timeout,
        } => run_load(&manifest, &ids, Duration::from_secs(timeout)).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {:#}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn run_resolve(config_path: Option<&Path>, names: &[String]) -> anyhow::Result<()> {
    let options = match config_path {
        Some(path) => LoaderConfig::from_file(path)?,
        None => LoaderConfig::default(),
    };
    for (name, id, url) in resolve(&options, names) {
        println!("{} {} {}", name.cyan(), id.green().bold(), url.dimmed());
    }
    Ok(())
}

/// Canonical id and URL for each name, resolved from the top level
fn resolve(options: &LoaderConfig, names: &[String]) -> Vec<(String, String, String)> {
    let mut config = Config::default();
    config.merge(options);
    names
        .iter()
        .map(|name| {
            let id = normalize(name, None, true, &config);
            let url = name_to_url(&id, None, false, &config);
            (name.clone(), id, url)
        })
        .collect()
}

async fn run_load(manifest_path: &Path, ids: &[String], limit: Duration) -> anyhow::Result<()> {
    let manifest = Manifest::from_file(manifest_path)?;
    let values = load(&manifest, ids, limit).await?;
    for (id, json) in render(ids, &values) {
        println!("{} = {}", id.cyan(), json);
    }
    Ok(())
}

/// Each id paired with its value as compact JSON
fn render<'a>(ids: &'a [String], values: &[Value]) -> Vec<(&'a str, String)> {
    ids.iter()
        .zip(values)
        .map(|(id, value)| (id.as_str(), value.to_json().to_string()))
        .collect()
}

/// Require `ids` in a loader serving `manifest`; values in request order
///
/// The event loop runs for at most `limit`, so a stalled script cannot hang
/// the command when `waitSeconds` is 0.
async fn load(manifest: &Manifest, ids: &[String], limit: Duration) -> anyhow::Result<Vec<Value>> {
    let loader = Loader::new(Rc::new(manifest.host()));
    let ctx = loader.config(&manifest.config);
    ctx.define_plugin(TextPlugin::ID, TextPlugin);

    let deps: Vec<&str> = ids.iter().map(String::as_str).collect();
    let promise = ctx.require_all(&deps);
    loader.run_for(limit).await?;

    if let Some(reason) = promise.reason() {
        return Err(reason.into());
    }
    let Some(values) = promise.value() else {
        anyhow::bail!(
            "modules did not finish loading within {}s: {}",
            limit.as_secs(),
            ids.join(", ")
        );
    };
    Ok(values.as_array().map(<[Value]>::to_vec).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const LIMIT: Duration = Duration::from_secs(30);

    const MANIFEST: &str = r#"{
        "config": { "baseUrl": "js", "shim": { "legacy": { "exports": "Legacy" } } },
        "scripts": {
            "js/a.js": { "defines": [{ "deps": ["b", "text!tpl.html"] }] },
            "js/b.js": { "defines": [{ "value": 42 }] },
            "js/legacy.js": { "globals": { "Legacy": "old" } }
        },
        "resources": { "js/tpl.html": "<p>hi</p>" }
    }"#;

    #[test]
    fn test_resolve_applies_paths() {
        let options =
            LoaderConfig::from_json_str(r#"{ "baseUrl": "js", "paths": { "lib": "vendor/lib" } }"#)
                .unwrap();
        let resolved = resolve(&options, &["lib/util".to_string(), "app/./main".to_string()]);

        assert_eq!(resolved[0].1, "lib/util");
        assert_eq!(resolved[0].2, "js/vendor/lib/util.js");
        assert_eq!(resolved[1].1, "app/main");
        assert_eq!(resolved[1].2, "js/app/main.js");
    }

    #[tokio::test]
    async fn test_load_manifest() {
        let manifest = Manifest::from_json_str(MANIFEST).unwrap();
        let values = load(&manifest, &["a".to_string(), "legacy".to_string()], LIMIT)
            .await
            .unwrap();

        let a = values[0].as_object().unwrap();
        assert_eq!(a.get("b"), Some(Value::from(42)));
        assert_eq!(a.get("text!tpl.html"), Some(Value::from("<p>hi</p>")));
        assert_eq!(values[1], Value::from("old"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_async_manifest_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "async": true, "latencyMs": 25, "scripts": {{ "./x.js": {{ "defines": [{{ "value": "x" }}] }} }} }}"#
        )
        .unwrap();

        let manifest = Manifest::from_file(file.path()).unwrap();
        let values = load(&manifest, &["x".to_string()], LIMIT).await.unwrap();
        assert_eq!(values, vec![Value::from("x")]);
    }

    #[tokio::test]
    async fn test_load_reports_missing_script() {
        let manifest = Manifest::from_json_str("{}").unwrap();
        let err = load(&manifest, &["nowhere".to_string()], LIMIT).await.unwrap_err();
        assert!(err.to_string().contains("nowhere"));
    }

    #[tokio::test]
    async fn test_render_prints_integral_numbers() {
        let manifest = Manifest::from_json_str(MANIFEST).unwrap();
        let ids = vec!["a".to_string(), "b".to_string()];
        let values = load(&manifest, &ids, LIMIT).await.unwrap();

        assert_eq!(
            render(&ids, &values),
            vec![
                ("a", r#"{"b":42,"text!tpl.html":"<p>hi</p>"}"#.to_string()),
                ("b", "42".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_gives_up_on_stalled_script() {
        let manifest = Manifest::from_json_str(
            r#"{ "async": true, "config": { "waitSeconds": 0 }, "stall": ["./stuck.js"] }"#,
        )
        .unwrap();

        let err = load(&manifest, &["stuck".to_string()], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("within 5s: stuck"));
    }
}
