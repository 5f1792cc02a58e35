#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use admin_http_client::{
    ApiClient, ClientConfig, FallbackPrompt, FormData, HeadlessSurface, Location, Navigator,
    Payload, RequestDescriptor, SessionCoordination, SessionExpiredNotifier,
};
use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(name = "adminctl")]
#[command(about = "Send one request through the admin console API pipeline")]
struct Cli {
    /// Overrides ADMIN_API_BASE_URL.
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long, env = "ADMIN_API_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// Sent as Accept-Language.
    #[arg(long)]
    locale: Option<String>,
    /// Page the login redirect should return to.
    #[arg(long, default_value = "/")]
    location: String,
    #[arg(value_enum)]
    method: Verb,
    path: String,
    #[arg(long = "query", value_parser = parse_pair)]
    query: Vec<(String, String)>,
    #[arg(long, conflicts_with_all = ["fields", "files"])]
    json: Option<String>,
    #[arg(long = "field", value_parser = parse_pair)]
    fields: Vec<(String, String)>,
    #[arg(long = "file", value_parser = parse_pair)]
    files: Vec<(String, String)>,
    /// Write the raw response body here instead of printing it.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Verb {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

/// Answers the session-expired prompt on the terminal.
struct TerminalPrompt;

impl FallbackPrompt for TerminalPrompt {
    fn confirm(&self, message: &str) -> Option<bool> {
        eprint!("{message} Sign in again? [y/N] ");
        std::io::stderr().flush().ok()?;
        let mut answer = String::new();
        std::io::stdin().lock().read_line(&mut answer).ok()?;
        Some(matches!(answer.trim(), "y" | "Y" | "yes"))
    }
}

/// Has no page to leave; prints where the user should sign in.
struct TerminalNavigator {
    location: Location,
}

impl Navigator for TerminalNavigator {
    fn current_location(&self) -> Location {
        self.location.clone()
    }

    fn assign(&self, url: &str) {
        eprintln!("sign in at: {url}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ClientConfig::from_env().context("load client config from environment")?;
    if let Some(base_url) = cli.base_url.clone() {
        config.base_url = base_url;
    }

    let navigator = Arc::new(TerminalNavigator {
        location: Location::parse(&cli.location),
    });
    let session = Arc::new(SessionCoordination::new(
        SessionExpiredNotifier::new(Arc::new(HeadlessSurface), Arc::new(TerminalPrompt)),
        config.routing.clone(),
        navigator,
    ));
    let client = ApiClient::with_session(config, session).context("build api client")?;
    client.update_token(cli.token.as_deref());
    client.update_locale(cli.locale.as_deref());

    let request = build_request(&cli)?;
    tracing::debug!(method = ?cli.method, path = %cli.path, "sending request");
    let payload = match client.send_raw(request).await {
        Ok(payload) => payload,
        Err(error) => {
            if error.is_session_expired() {
                client.session().notifier().wait_idle().await;
            }
            return Err(error).with_context(|| format!("{:?} {}", cli.method, cli.path));
        }
    };

    match cli.output {
        Some(path) => {
            std::fs::write(&path, payload.into_bytes())
                .with_context(|| format!("write response to {}", path.display()))?;
            eprintln!("wrote {}", path.display());
        }
        None => print_payload(payload)?,
    }
    Ok(())
}

fn build_request(cli: &Cli) -> Result<RequestDescriptor> {
    let mut request = match cli.method {
        Verb::Get => RequestDescriptor::get(cli.path.clone()),
        Verb::Post => RequestDescriptor::post(cli.path.clone()),
        Verb::Put => RequestDescriptor::put(cli.path.clone()),
        Verb::Patch => RequestDescriptor::patch(cli.path.clone()),
        Verb::Delete => RequestDescriptor::delete(cli.path.clone()),
    };
    for (key, value) in &cli.query {
        request = request.query(key.clone(), value.clone());
    }

    if let Some(raw) = &cli.json {
        let body: Value = serde_json::from_str(raw).context("parse --json body")?;
        request = request.json(&body)?;
    } else if !cli.fields.is_empty() || !cli.files.is_empty() {
        if matches!(cli.method, Verb::Get | Verb::Delete) {
            bail!("form fields need a post, put or patch request");
        }
        let mut form = FormData::new();
        for (name, value) in &cli.fields {
            form = form.text(name.clone(), value.clone());
        }
        for (name, path) in &cli.files {
            form = attach_file(form, name, Path::new(path))?;
        }
        request = request.form(form);
    }
    Ok(request)
}

fn attach_file(form: FormData, name: &str, path: &Path) -> Result<FormData> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|file_name| file_name.to_string_lossy().into_owned());
    Ok(form.file(name, bytes, file_name, None))
}

fn print_payload(payload: Payload) -> Result<()> {
    match payload {
        Payload::Json(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Payload::Text(text) => println!("{text}"),
        Payload::Binary(bytes) if bytes.is_empty() => {}
        Payload::Binary(bytes) => {
            eprintln!("{} bytes of binary data; use --output to save them", bytes.len());
        }
    }
    Ok(())
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing key in `{raw}`"));
    }
    Ok((key.to_string(), value.to_string()))
}
