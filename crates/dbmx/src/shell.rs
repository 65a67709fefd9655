//! Line commands understood by the dbmx shell.
//!
//! Lines are split with shell quoting rules, so arguments with spaces must
//! be quoted: `add-sqlite notes "~/My Notes/notes.db"`. SQL given as several
//! words is joined with single spaces; quote it to keep it verbatim.

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand};
use dbmx_core::services::parse_connection_id;
use dbmx_core::{ConnectionDescriptor, ConnectionRef, DbmxError, DeleteOutcome, Result, Workspace};
use serde_json::{json, Value as JsonValue};

/// One input line; the first word names the command.
#[derive(Debug, Parser)]
#[command(name = "dbmx", multicall = true, disable_help_subcommand = true)]
struct Line {
    #[command(subcommand)]
    command: Command,
}

/// A parsed shell command.
#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// List tabs
    Tabs,
    /// Open a new tab
    New,
    /// Activate a tab
    Use { tab: i64 },
    /// Delete a tab
    Close { tab: i64 },
    /// Replace a tab's editor text
    Edit {
        tab: i64,
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        sql: Vec<String>,
    },
    /// Rename a tab
    Rename {
        tab: i64,
        #[arg(required = true, num_args = 1.., trailing_var_arg = true)]
        name: Vec<String>,
    },
    /// Point a tab at a saved connection
    Bind { tab: i64, connection: String },
    /// Run SQL, or the tab's editor text, on the tab's connection
    Run {
        tab: i64,
        #[arg(num_args = 0.., trailing_var_arg = true, allow_hyphen_values = true)]
        sql: Vec<String>,
    },
    /// List saved connections
    Conns,
    /// Save an SQLite connection
    AddSqlite { name: String, path: String },
    /// Save a PostgreSQL connection
    #[command(name = "add-pg")]
    AddPostgres {
        name: String,
        host: String,
        port: u16,
        user: String,
        #[arg(allow_hyphen_values = true)]
        password: String,
        database: String,
        /// Environment label such as dev or prod
        env: Option<String>,
    },
    /// Remove a saved connection
    #[command(name = "rm-conn")]
    RemoveConnection { connection: String },
    /// List commands, or show one command's usage
    #[command(alias = "?")]
    Help { topic: Option<String> },
    /// Exit the shell
    #[command(alias = "exit")]
    Quit,
}

impl Command {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let words = shlex::split(line).ok_or_else(|| DbmxError::config("Unterminated quote"))?;
        let Some(verb) = words.first().cloned() else {
            return Ok(None);
        };

        match Line::try_parse_from(words) {
            Ok(line) => Ok(Some(line.command)),
            Err(e) if e.kind() == ErrorKind::DisplayHelp => Ok(Some(Self::Help { topic: Some(verb) })),
            Err(e) => Err(DbmxError::config(e.render().to_string().trim_end())),
        }
    }
}

/// Usage text for every command, or for one.
fn help_text(topic: Option<&str>) -> Result<String> {
    let mut root = Line::command();
    let help = match topic {
        None => root.render_help(),
        Some(name) => root
            .find_subcommand_mut(name)
            .ok_or_else(|| DbmxError::config(format!("Unknown command: {name}")))?
            .render_help(),
    };
    Ok(help.to_string())
}

/// Run a command against the workspace and render its result as JSON.
pub fn execute(workspace: &Workspace, command: Command) -> Result<JsonValue> {
    let tabs = workspace.tabs();
    let registry = workspace.registry();

    let value = match command {
        Command::Tabs => serde_json::to_value(tabs.list_tabs()?)?,
        Command::New => serde_json::to_value(tabs.create_tab(ConnectionRef::none())?)?,
        Command::Use { tab } => serde_json::to_value(tabs.set_active_tab(tab)?)?,
        Command::Close { tab: id } => {
            let outcome = tabs.delete_tab(id)?;
            let status = match &outcome {
                DeleteOutcome::Promoted(_) => "promoted",
                DeleteOutcome::ActiveUnchanged => "active-unchanged",
                DeleteOutcome::Emptied => "emptied",
            };
            json!({ "deleted": id, "outcome": status, "active": outcome.into_promoted() })
        }
        Command::Edit { tab, sql } => {
            tabs.update_editor_content(tab, &sql.join(" "))?;
            json!({ "ok": true })
        }
        Command::Rename { tab, name } => {
            tabs.rename_tab(tab, &name.join(" "))?;
            json!({ "ok": true })
        }
        Command::Bind { tab, connection } => {
            let reference = reference_for(workspace, &connection);
            tabs.save_connection_reference(tab, &reference)?;
            serde_json::to_value(reference)?
        }
        Command::Run { tab, sql } => {
            let sql = if sql.is_empty() {
                tabs.get_tab(tab)?.editor
            } else {
                let sql = sql.join(" ");
                tabs.update_editor_content(tab, &sql)?;
                sql
            };
            serde_json::to_value(workspace.block_on(workspace.run_tab_query(tab, &sql, &[])))?
        }
        Command::Conns => serde_json::to_value(registry.descriptors())?,
        Command::AddSqlite { name, path } => {
            serde_json::to_value(registry.add(ConnectionDescriptor::sqlite(name, path))?)?
        }
        Command::AddPostgres { name, host, port, user, password, database, env } => {
            let mut descriptor =
                ConnectionDescriptor::postgres(name, host, database, user, password).with_port(port);
            if let Some(env) = env {
                descriptor = descriptor.with_env(env);
            }
            serde_json::to_value(registry.add(descriptor)?)?
        }
        Command::RemoveConnection { connection } => {
            let id = parse_connection_id(&connection)?;
            workspace.block_on(registry.remove(id))?;
            json!({ "removed": id })
        }
        Command::Help { topic } => json!(help_text(topic.as_deref())?.lines().collect::<Vec<_>>()),
        Command::Quit => JsonValue::Null,
    };
    Ok(value)
}

/// Build a tab reference, copying name and colour from a known connection.
///
/// Unknown identifiers are stored as given.
fn reference_for(workspace: &Workspace, connection: &str) -> ConnectionRef {
    let known = parse_connection_id(connection).ok().and_then(|id| workspace.registry().get(id));
    match known {
        Some(descriptor) => ConnectionRef::new(
            &descriptor.id.to_string(),
            &descriptor.name,
            descriptor.colour.as_deref().unwrap_or(""),
        ),
        None => ConnectionRef::new(connection, "", ""),
    }
}

/// Render an error the way the shell prints it.
pub fn error_json(error: &DbmxError) -> JsonValue {
    let info = error.to_error_info();
    json!({
        "ok": false,
        "error": info.error_type,
        "message": info.message,
        "hint": info.hint,
        "detail": info.technical_detail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(workspace: &Workspace, line: &str) -> Result<JsonValue> {
        let command = Command::parse(line)?.unwrap();
        execute(workspace, command)
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("   ").unwrap(), None);
        assert_eq!(Command::parse("use 3").unwrap(), Some(Command::Use { tab: 3 }));
        assert_eq!(
            Command::parse("run 2 SELECT  1,  2").unwrap(),
            Some(Command::Run { tab: 2, sql: vec!["SELECT".into(), "1,".into(), "2".into()] })
        );
        assert_eq!(
            Command::parse(r#"run 2 "SELECT 'a  b' AS x""#).unwrap(),
            Some(Command::Run { tab: 2, sql: vec!["SELECT 'a  b' AS x".into()] })
        );
        assert_eq!(Command::parse("run 2").unwrap(), Some(Command::Run { tab: 2, sql: vec![] }));
        assert_eq!(
            Command::parse("add-pg prod db.local 6543 app s3cret sales prod").unwrap(),
            Some(Command::AddPostgres {
                name: "prod".to_string(),
                host: "db.local".to_string(),
                port: 6543,
                user: "app".to_string(),
                password: "s3cret".to_string(),
                database: "sales".to_string(),
                env: Some("prod".to_string()),
            })
        );
        assert_eq!(Command::parse("exit").unwrap(), Some(Command::Quit));
    }

    #[test]
    fn test_quoted_arguments_keep_spaces() {
        assert_eq!(
            Command::parse(r#"add-sqlite db "/tmp/my db.sqlite""#).unwrap(),
            Some(Command::AddSqlite { name: "db".to_string(), path: "/tmp/my db.sqlite".to_string() })
        );

        match Command::parse("add-pg prod localhost 5432 app 'pass word' sales").unwrap() {
            Some(Command::AddPostgres { password, env, .. }) => {
                assert_eq!(password, "pass word");
                assert_eq!(env, None);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(Command::parse("use abc").is_err());
        assert!(Command::parse("add-sqlite only-name").is_err());
        assert!(Command::parse("add-pg a b notaport c d e").is_err());
        assert!(Command::parse("rm-conn").is_err());
        assert_eq!(Command::parse("edit 1 \"SELECT").unwrap_err().to_string(), "Config error: Unterminated quote");

        let err = Command::parse("frobnicate").unwrap_err();
        assert_eq!(err.category(), "Config");
        assert!(err.to_string().contains("frobnicate"));
    }

    #[test]
    fn test_help() {
        assert_eq!(Command::parse("help").unwrap(), Some(Command::Help { topic: None }));
        assert_eq!(
            Command::parse("use --help").unwrap(),
            Some(Command::Help { topic: Some("use".to_string()) })
        );

        let all = help_text(None).unwrap();
        assert!(all.contains("add-pg"));
        assert!(all.contains("rm-conn"));
        assert!(help_text(Some("bind")).unwrap().contains("<CONNECTION>"));
        assert!(help_text(Some("nope")).is_err());
    }

    #[test]
    fn test_tab_session() {
        let workspace = Workspace::in_memory().unwrap();

        let conn = run(&workspace, "add-sqlite scratch :memory:").unwrap();
        let conn_id = conn["id"].as_str().unwrap().to_string();
        assert!(conn.get("password").is_none());

        let tab = run(&workspace, "new").unwrap();
        let tab_id = tab["id"].as_i64().unwrap();
        let bound = run(&workspace, &format!("bind {tab_id} {conn_id}")).unwrap();
        assert_eq!(bound["activeDBName"], json!("scratch"));

        let response = run(&workspace, &format!("run {tab_id} SELECT 1 AS one")).unwrap();
        assert_eq!(response["ok"], json!(true));
        assert_eq!(response["data"], json!([{"one": 1}]));

        // Re-running without sql uses the saved editor text
        let again = run(&workspace, &format!("run {tab_id}")).unwrap();
        assert_eq!(again["data"], json!([{"one": 1}]));

        let closed = run(&workspace, &format!("close {tab_id}")).unwrap();
        assert_eq!(closed["outcome"], json!("emptied"));
        assert_eq!(closed["active"], JsonValue::Null);

        workspace.shutdown();
    }

    #[test]
    fn test_bind_unknown_connection_is_kept() {
        let workspace = Workspace::in_memory().unwrap();
        let tab = run(&workspace, "new").unwrap();
        let tab_id = tab["id"].as_i64().unwrap();

        let bound = run(&workspace, &format!("bind {tab_id} not-a-connection")).unwrap();
        assert_eq!(bound["activeDBID"], json!("not-a-connection"));
        assert_eq!(bound["activeDBName"], JsonValue::Null);

        let response = run(&workspace, &format!("run {tab_id} SELECT 1")).unwrap();
        assert_eq!(response["ok"], json!(false));
        assert_eq!(response["message"], json!("Connection not found: not-a-connection"));
    }

    #[test]
    fn test_error_json() {
        let value = error_json(&DbmxError::tab_not_found(7));
        assert_eq!(value["error"], json!("NotFound Error"));
        assert_eq!(value["message"], json!("Tab not found: 7"));
    }
}
