/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FauxGate - MongoDB wire-compatible front end for DocumentDB on PostgreSQL
 *
 * @file commands.rs
 * @brief Command registry: name to handler, built once at startup
 */

use crate::backend::CallContext;
use crate::connection::ConnectionContext;
use crate::dispatcher::{Request, Services};
use crate::error::Result;
use crate::handlers;
use bson::Document;
use futures::future::BoxFuture;
use std::collections::HashMap;

/// Everything a handler may touch for one request.
pub struct CommandContext<'a> {
    pub services: &'a Services,
    pub connection: &'a ConnectionContext,
    pub request: &'a Request,
    pub call: CallContext,
}

pub type HandlerFuture<'a> = BoxFuture<'a, Result<Document>>;
pub type CommandHandler = for<'a> fn(&'a CommandContext<'a>) -> HandlerFuture<'a>;

#[derive(Clone, Copy)]
pub struct Command {
    pub name: &'static str,
    pub handler: CommandHandler,
    /// Safe to run twice; only these are retried on transient backend errors.
    pub read_only: bool,
    pub requires_auth: bool,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("read_only", &self.read_only)
            .field("requires_auth", &self.requires_auth)
            .finish()
    }
}

#[derive(Debug)]
pub struct CommandRegistry {
    commands: HashMap<String, Command>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            commands: HashMap::new(),
        };

        registry.register_all_commands();
        registry
    }

    fn register_all_commands(&mut self) {
        // Handshake and diagnostics
        self.register_command("hello", handlers::hello, true, false);
        self.register_command("isMaster", handlers::hello, true, false);
        self.register_command("ismaster", handlers::hello, true, false);
        self.register_command("ping", handlers::ping, true, false);
        self.register_command("buildInfo", handlers::build_info, true, false);
        self.register_command("buildinfo", handlers::build_info, true, false);
        self.register_command("currentOp", handlers::current_op, true, true);

        // Cursor-producing and cursor commands
        self.register_command("find", handlers::find, true, true);
        self.register_command("aggregate", handlers::aggregate, false, true);
        self.register_command("listCollections", handlers::list_collections, true, true);
        self.register_command("getMore", handlers::get_more, false, true);
        self.register_command("killCursors", handlers::kill_cursors, false, true);

        // Sessions
        self.register_command("endSessions", handlers::end_sessions, false, false);
        self.register_command("refreshSessions", handlers::refresh_sessions, false, false);
        self.register_command("killSessions", handlers::kill_sessions, false, true);

        // Forwarded unchanged to the backend
        self.register_command("count", handlers::passthrough, true, true);
        self.register_command("listDatabases", handlers::passthrough, true, true);
        self.register_command("insert", handlers::passthrough, false, true);
        self.register_command("update", handlers::passthrough, false, true);
        self.register_command("delete", handlers::passthrough, false, true);
        self.register_command("create", handlers::passthrough, false, true);
        self.register_command("drop", handlers::passthrough, false, true);
        self.register_command("dropDatabase", handlers::passthrough, false, true);
    }

    fn register_command(
        &mut self,
        name: &'static str,
        handler: CommandHandler,
        read_only: bool,
        requires_auth: bool,
    ) {
        self.commands.insert(
            name.to_string(),
            Command {
                name,
                handler,
                read_only,
                requires_auth,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    pub fn command_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_contents() {
        let registry = CommandRegistry::new();
        for name in ["hello", "isMaster", "ismaster", "find", "getMore", "killCursors", "currentOp"] {
            assert!(registry.contains(name), "{} missing", name);
        }
        assert!(!registry.contains("mapReduce"));

        assert!(registry.get("find").unwrap().read_only);
        assert!(!registry.get("insert").unwrap().read_only);
        assert!(!registry.get("hello").unwrap().requires_auth);
    }
}
