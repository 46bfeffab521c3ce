//! 🚀 dstx-cli: poke at mappings, schemas and subscriptions from the terminal.
//!
//! 🎬 Loads config, sets up logging, then hands the subcommand to the library. Errors come back
//! up here and get their whole cause chain printed, like the onion they are. 🧅

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use comfy_table::{Table, presets::UTF8_FULL};
use dstx::app_config::{AppConfig, load_config};
use dstx::mapping::{get_path, transform, transform_batch, validate};
use dstx::request_client::{RequestClient, RequestOptions};
use dstx::schema::{FieldMap, SchemaOptions, fields_to_schema};
use serde_json::Value;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dstx", version, about = "Mappings in, partner payloads out")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML config file. Env vars (DSTX_*) apply either way.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a mapping against one payload and print the result
    Resolve {
        #[arg(long)]
        mapping: PathBuf,
        #[arg(long)]
        payload: PathBuf,
    },
    /// Check a mapping's shape and list every problem
    Validate {
        #[arg(long)]
        mapping: PathBuf,
    },
    /// Resolve a mapping against every line of an NDJSON file
    Batch {
        #[arg(long)]
        mapping: PathBuf,
        #[arg(long)]
        payloads: PathBuf,
    },
    /// Print the JSON Schema for a set of field declarations
    Schema {
        #[arg(long)]
        fields: PathBuf,
    },
    /// Evaluate an FQL subscription against one event
    Subscribed {
        #[arg(long)]
        fql: String,
        #[arg(long)]
        event: PathBuf,
    },
    /// Resolve a mapping and POST the result
    Send {
        #[arg(long)]
        url: String,
        #[arg(long)]
        mapping: PathBuf,
        #[arg(long)]
        payload: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // 📡 RUST_LOG decides how chatty we are
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = run(cli).await;

    if let Err(err) = result {
        error!("💀 error: {}", err);
        let mut the_partner_is_ghosting_us = false;
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {}", cause);
            let cause_str = cause.to_string();
            if cause_str.contains("error sending request")
                || cause_str.contains("onnection refused")
                || cause_str.contains("dns error")
                || cause_str.contains("timed out")
            {
                the_partner_is_ghosting_us = true;
            }
        }
        if the_partner_is_ghosting_us {
            error!(
                "🔧 hint: the partner endpoint is not answering. Check the URL, and raise \
                 request.timeout_ms (or DSTX_REQUEST__TIMEOUT_MS) if it is just slow."
            );
        }
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())
        .context("💀 Couldn't load the config. Check the file and any DSTX_* variables.")?;

    match cli.command {
        Commands::Resolve { mapping, payload } => {
            let mapping = read_json(&mapping)?;
            let payload = read_json(&payload)?;
            let resolved = transform(&mapping, &payload).context("💀 mapping did not resolve")?;
            print_json(&resolved.unwrap_or(Value::Null))
        }
        Commands::Validate { mapping } => validate_mapping(&read_json(&mapping)?),
        Commands::Batch { mapping, payloads } => {
            let mapping = read_json(&mapping)?;
            let payloads = read_ndjson(&payloads)?;
            info!("📦 resolving {} payloads", payloads.len());
            let resolved = transform_batch(&mapping, &payloads)
                .context("💀 batch did not resolve")?;
            for item in resolved {
                println!("{}", serde_json::to_string(&item.unwrap_or(Value::Null))?);
            }
            Ok(())
        }
        Commands::Schema { fields } => {
            let fields: FieldMap = serde_json::from_value(read_json(&fields)?)
                .context("💀 those are not field declarations")?;
            print_json(&fields_to_schema(&fields, &SchemaOptions::default()))
        }
        Commands::Subscribed { fql, event } => {
            let condition = dstx::destination::parse_fql(&fql)
                .with_context(|| format!("💀 invalid subscription '{fql}'"))?;
            let event = read_json(&event)?;
            let matched = condition.evaluate(&event);
            let kind = get_path(&event, "type").and_then(Value::as_str).unwrap_or("?");
            println!(
                "{} ({kind} event)",
                if matched { "✅ subscribed" } else { "🚫 not subscribed" }
            );
            Ok(())
        }
        Commands::Send {
            url,
            mapping,
            payload,
        } => send(&config, &url, &read_json(&mapping)?, &read_json(&payload)?).await,
    }
}

fn validate_mapping(mapping: &Value) -> Result<()> {
    let Err(invalid) = validate(mapping) else {
        println!("✅ mapping is valid");
        return Ok(());
    };
    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec!["Path", "Problem"]);
    for issue in &invalid.issues {
        table.add_row(vec![issue.pointer(), issue.message.clone()]);
    }
    println!("{table}");
    bail!("💀 mapping has {} problem(s)", invalid.issues.len())
}

async fn send(config: &AppConfig, url: &str, mapping: &Value, payload: &Value) -> Result<()> {
    let body = transform(mapping, payload)
        .context("💀 mapping did not resolve")?
        .unwrap_or(Value::Null);
    let client = RequestClient::new(config.request.to_request_options());
    let response = client
        .post(url, RequestOptions::new().json(body))
        .await
        .with_context(|| format!("💀 POST {url} failed"))?;
    info!("📬 {} {}", response.status, response.status_text);
    print_json(&response.body_value())
}

fn read_json(path: &Path) -> Result<Value> {
    let raw = std::fs::read(path)
        .with_context(|| format!("💀 couldn't read '{}'", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("💀 '{}' is not JSON", path.display()))
}

/// One JSON value per line. Blank lines are skipped.
fn read_ndjson(path: &Path) -> Result<Vec<Value>> {
    let raw = std::fs::read(path)
        .with_context(|| format!("💀 couldn't read '{}'", path.display()))?;
    let mut values = Vec::new();
    let mut start = 0;
    let ends = memchr::memchr_iter(b'\n', &raw).chain(std::iter::once(raw.len()));
    for (line_no, end) in ends.enumerate() {
        let line = &raw[start..end];
        start = (end + 1).min(raw.len());
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let value = serde_json::from_slice(line).with_context(|| {
            format!("💀 line {} of '{}' is not JSON", line_no + 1, path.display())
        })?;
        values.push(value);
    }
    Ok(values)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn the_one_where_ndjson_skips_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().expect("💀 temp file");
        file.write_all(b"{\"a\":1}\n\n  \n{\"a\":2}")
            .expect("💀 write");
        let values = read_ndjson(file.path()).expect("💀 ndjson should parse");
        assert_eq!(values, vec![serde_json::json!({"a": 1}), serde_json::json!({"a": 2})]);
    }

    #[test]
    fn the_one_where_a_bad_line_is_named() {
        let mut file = tempfile::NamedTempFile::new().expect("💀 temp file");
        file.write_all(b"{\"a\":1}\nnope\n").expect("💀 write");
        let err = read_ndjson(file.path()).expect_err("💀 line 2 is garbage");
        assert!(err.to_string().contains("line 2"));
    }
}
