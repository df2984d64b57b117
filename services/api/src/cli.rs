use crate::server;
use affiliation_sync::config::LocalConfig;
use affiliation_sync::error::AppError;
use affiliation_sync::platform::{GroupId, UserId};
use affiliation_sync::stores::{AliasStore, ExceptionStore, SettlementGroupStore};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(
    name = "Affiliation Sync",
    about = "Verify community members against the affiliation service and keep their identity in sync",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service and the verification scheduler (default command)
    Serve(ServeArgs),
    /// Resolve one member through the running service without changing anything
    Resolve {
        /// Platform user id to resolve
        user_id: u64,
        /// Base URL of the running service (defaults to APP_HOST:APP_PORT)
        #[arg(long)]
        server: Option<String>,
    },
    /// Manage members that are never verified
    Exceptions {
        #[command(subcommand)]
        command: ExceptionCommand,
    },
    /// Manage display-name labels that override the default
    Aliases {
        #[command(subcommand)]
        command: AliasCommand,
    },
    /// Manage the settlement to group mapping
    Settlements {
        #[command(subcommand)]
        command: SettlementCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ExceptionCommand {
    Add { user_id: u64 },
    Remove { user_id: u64 },
    List,
}

#[derive(Subcommand, Debug)]
enum AliasCommand {
    Set { user_id: u64, alias: String },
    Remove { user_id: u64 },
    List,
}

#[derive(Subcommand, Debug)]
enum SettlementCommand {
    Map { name: String, group_id: u64 },
    Unmap { name: String },
    List,
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Resolve { user_id, server } => resolve(UserId(user_id), server).await,
        Command::Exceptions { command } => exceptions(command),
        Command::Aliases { command } => aliases(command),
        Command::Settlements { command } => settlements(command),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value).map_err(std::io::Error::from)?;
    println!("{rendered}");
    Ok(())
}

/// Lookups share the server's rate limiter and resolver, so the CLI asks the
/// server instead of calling the lookup service itself.
async fn resolve(user_id: UserId, server: Option<String>) -> Result<(), AppError> {
    let base = match server {
        Some(base) => base,
        None => format!("http://{}", LocalConfig::load()?.server.socket_addr()?),
    };
    let outcome = fetch_resolution(&base, user_id).await?;
    print_json(&outcome)
}

async fn fetch_resolution(base: &str, user_id: UserId) -> Result<Value, AppError> {
    let url = format!("{}/api/v1/lookup/{user_id}", base.trim_end_matches('/'));
    let remote = |err: reqwest::Error| AppError::Remote(format!("{url}: {err}"));

    let response = reqwest::get(&url).await.map_err(remote)?;
    let status = response.status();
    let body: Value = response.json().await.map_err(remote)?;
    if !status.is_success() {
        return Err(AppError::Remote(format!("{url} answered {status}: {body}")));
    }
    Ok(body)
}

fn exceptions(command: ExceptionCommand) -> Result<(), AppError> {
    let config = LocalConfig::load()?;
    let store = ExceptionStore::new(config.storage.exceptions_path());
    match command {
        ExceptionCommand::Add { user_id } => {
            let added = store.add(UserId(user_id))?;
            println!("{}", if added { "added" } else { "already excepted" });
        }
        ExceptionCommand::Remove { user_id } => {
            let removed = store.remove(UserId(user_id))?;
            println!("{}", if removed { "removed" } else { "not excepted" });
        }
        ExceptionCommand::List => print_json(&store.list()?)?,
    }
    Ok(())
}

fn aliases(command: AliasCommand) -> Result<(), AppError> {
    let config = LocalConfig::load()?;
    let store = AliasStore::new(config.storage.aliases_path(), config.separator);
    match command {
        AliasCommand::Set { user_id, alias } => {
            store.set(UserId(user_id), &alias)?;
            println!("alias for {user_id} set to {alias}");
        }
        AliasCommand::Remove { user_id } => {
            let removed = store.remove(UserId(user_id))?;
            println!("{}", if removed { "removed" } else { "no alias set" });
        }
        AliasCommand::List => print_json(&store.list()?)?,
    }
    Ok(())
}

fn settlements(command: SettlementCommand) -> Result<(), AppError> {
    let config = LocalConfig::load()?;
    let store = SettlementGroupStore::new(config.storage.settlement_groups_path());
    match command {
        SettlementCommand::Map { name, group_id } => {
            store.set(&name, GroupId(group_id))?;
            println!("{name} mapped to group {group_id}");
        }
        SettlementCommand::Unmap { name } => {
            let removed = store.remove(&name)?;
            println!("{}", if removed { "unmapped" } else { "not mapped" });
        }
        SettlementCommand::List => print_json(&store.list()?)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn serve_is_the_default_command() {
        let cli = Cli::try_parse_from(["affiliation-sync"]).expect("parses");
        assert!(cli.command.is_none());
    }

    #[test]
    fn parses_store_subcommands() {
        let cli = Cli::try_parse_from(["affiliation-sync", "settlements", "map", "Harbor", "40"])
            .expect("parses");
        match cli.command {
            Some(Command::Settlements {
                command: SettlementCommand::Map { name, group_id },
            }) => {
                assert_eq!(name, "Harbor");
                assert_eq!(group_id, 40);
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::try_parse_from(["affiliation-sync", "serve", "--port", "9090"])
            .expect("parses");
        assert!(matches!(
            cli.command,
            Some(Command::Serve(ServeArgs { port: Some(9090), .. }))
        ));
    }

    #[tokio::test]
    async fn resolve_asks_the_running_service() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/lookup/5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "failure",
                "stage": "account-lookup",
                "reason": { "kind": "empty-result" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let body = fetch_resolution(&format!("{}/", server.uri()), UserId(5))
            .await
            .expect("service answers");

        assert_eq!(body["stage"], "account-lookup");
    }

    #[tokio::test]
    async fn resolve_surfaces_service_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/lookup/5"))
            .respond_with(
                ResponseTemplate::new(502).set_body_json(json!({ "error": "lookup error" })),
            )
            .mount(&server)
            .await;

        match fetch_resolution(&server.uri(), UserId(5)).await {
            Err(AppError::Remote(message)) => assert!(message.contains("502")),
            other => panic!("expected remote error, got {other:?}"),
        }
    }
}
