//! Static routing metadata for Redis commands (spec.md §4.2, §6).
//!
//! Grounded on `rustis::commands::cluster_commands`'s `RequestPolicy`/
//! `ResponsePolicy` tags (which describe the same idea — how a command
//! fans out and how replies are merged) and, per §9 REDESIGN FLAGS, flattened
//! into one static table keyed on `(command, subcommand?)` instead of the
//! teacher's nested per-command-trait dispatch, since a flat table is easier
//! to test exhaustively.

use crate::resp::Command;

/// How a command is dispatched across the cluster (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingClass {
    Single,
    AllNodes,
    AllPrimaries,
    AllReplicas,
    SpecialSubcommand,
    Rejected,
    Ambiguous,
}

/// How replies from a fan-out are combined into one logical reply
/// (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    FirstReply,
    Sum,
    ConcatAndSort,
    SortedList,
    Flatten,
    FlattenUniqueSorted,
    MergeCountingMaps,
    ListPerNode,
    /// `scan` is handled by the scan coordinator, never by generic
    /// aggregation (spec.md §4.6).
    ScanCursor,
    /// Not applicable: `Single` commands have exactly one reply.
    None,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandInfo {
    pub first_key_index: usize,
    pub routing_class: RoutingClass,
    pub aggregation: Aggregation,
    pub read_only: bool,
}

const SINGLE_RW: CommandInfo = CommandInfo {
    first_key_index: 0,
    routing_class: RoutingClass::Single,
    aggregation: Aggregation::None,
    read_only: false,
};

const SINGLE_RO: CommandInfo = CommandInfo {
    first_key_index: 0,
    routing_class: RoutingClass::Single,
    aggregation: Aggregation::None,
    read_only: true,
};

/// `OBJECT <subcommand> <key>` — arg[0] is the subcommand, not the key
/// (unlike `SINGLE_RO`'s arg[0]), so it needs its own first-key index.
const SINGLE_RO_SUBCOMMAND_KEY: CommandInfo = CommandInfo {
    first_key_index: 1,
    routing_class: RoutingClass::Single,
    aggregation: Aggregation::None,
    read_only: true,
};

const SINGLE_KEYLESS: CommandInfo = CommandInfo {
    first_key_index: usize::MAX,
    routing_class: RoutingClass::Single,
    aggregation: Aggregation::None,
    read_only: false,
};

fn all_nodes(agg: Aggregation) -> CommandInfo {
    CommandInfo {
        first_key_index: usize::MAX,
        routing_class: RoutingClass::AllNodes,
        aggregation: agg,
        read_only: false,
    }
}

fn all_primaries(agg: Aggregation) -> CommandInfo {
    CommandInfo {
        first_key_index: usize::MAX,
        routing_class: RoutingClass::AllPrimaries,
        aggregation: agg,
        read_only: false,
    }
}

fn all_replicas(agg: Aggregation) -> CommandInfo {
    CommandInfo {
        first_key_index: usize::MAX,
        routing_class: RoutingClass::AllReplicas,
        aggregation: agg,
        read_only: true,
    }
}

const REJECTED: CommandInfo = CommandInfo {
    first_key_index: usize::MAX,
    routing_class: RoutingClass::Rejected,
    aggregation: Aggregation::None,
    read_only: false,
};

const AMBIGUOUS: CommandInfo = CommandInfo {
    first_key_index: usize::MAX,
    routing_class: RoutingClass::Ambiguous,
    aggregation: Aggregation::None,
    read_only: false,
};

const SCAN: CommandInfo = CommandInfo {
    first_key_index: usize::MAX,
    routing_class: RoutingClass::SpecialSubcommand,
    aggregation: Aggregation::ScanCursor,
    read_only: true,
};

/// Commands whose argument[1] selects a nested dispatch (spec.md §4.2).
const SPECIAL_SUBCOMMAND_COMMANDS: &[&str] =
    &["cluster", "client", "memory", "script", "config", "pubsub"];

/// Top-level, by-name lookup for commands that are not special-subcommand
/// dispatchers (spec.md §6 table).
fn top_level_info(name: &str) -> Option<CommandInfo> {
    Some(match name {
        "acl" | "auth" | "bgrewriteaof" | "bgsave" | "quit" | "save" => all_nodes(Aggregation::FirstReply),
        "lastsave" => all_nodes(Aggregation::SortedList),
        "role" => all_nodes(Aggregation::ListPerNode),

        "flushall" | "flushdb" => all_primaries(Aggregation::FirstReply),
        "wait" => all_primaries(Aggregation::Sum),

        "keys" => all_replicas(Aggregation::ConcatAndSort),
        "dbsize" => all_replicas(Aggregation::Sum),

        "scan" => SCAN,

        "readonly" | "readwrite" | "shutdown" => REJECTED,
        "multi" | "exec" | "discard" | "unwatch" => AMBIGUOUS,

        // read-only single-key commands (non-exhaustive, representative set)
        "get" | "mget" | "strlen" | "getrange" | "substr" | "exists" | "ttl" | "pttl"
        | "type" | "hget" | "hgetall" | "hmget" | "hkeys" | "hvals" | "hlen" | "lrange"
        | "llen" | "lindex" | "smembers" | "sismember" | "scard" | "srandmember" | "zrange"
        | "zscore" | "zcard" | "zrank" | "zrevrank" | "sscan" | "hscan" | "zscan"
        | "getbit" | "bitcount" | "dump" => SINGLE_RO,

        // container commands where arg[0] is a subcommand, not the key.
        "object" => SINGLE_RO_SUBCOMMAND_KEY,

        // keyless or admin single-node commands routed to an arbitrary
        // primary via `sample()` (spec.md §4.3, §8 boundary behavior).
        "ping" | "echo" | "time" | "info" | "command" | "lolwut" | "randomkey" => SINGLE_KEYLESS,

        _ => return None,
    })
}

/// Subcommand-level table for `cluster`, `client`, `memory`, `script`,
/// `config`, `pubsub` (spec.md §4.2, §6).
fn special_subcommand_info(command: &str, subcommand: &str) -> CommandInfo {
    match (command, subcommand) {
        ("cluster", "saveconfig") => all_nodes(Aggregation::FirstReply),
        (
            "cluster",
            "addslots" | "delslots" | "failover" | "forget" | "meet" | "replicate" | "reset"
            | "set-config-epoch" | "setslot",
        ) => REJECTED,

        ("client", "list") => all_nodes(Aggregation::Flatten),
        ("client", "pause" | "reply" | "setname") => all_nodes(Aggregation::FirstReply),

        ("memory", "stats") => all_nodes(Aggregation::ListPerNode),
        ("memory", "purge") => all_nodes(Aggregation::FirstReply),

        ("script", "debug" | "kill") => all_nodes(Aggregation::FirstReply),
        ("script", "flush" | "load") => all_primaries(Aggregation::FirstReply),

        ("config", "resetstat" | "rewrite" | "set") => all_nodes(Aggregation::FirstReply),

        ("pubsub", "channels") => all_nodes(Aggregation::FlattenUniqueSorted),
        ("pubsub", "numsub") => all_nodes(Aggregation::MergeCountingMaps),
        ("pubsub", "numpat") => all_nodes(Aggregation::Sum),

        // any other subcommand of a special-dispatch command not listed
        // above passes through as a single-key/keyless command (e.g.
        // `cluster countkeysinslot`, `config get`).
        _ => SINGLE_KEYLESS,
    }
}

/// Classify `command`, dispatching into the special-subcommand table when
/// `command[0]` is one of the nested-dispatch commands (spec.md §4.2).
pub fn classify(command: &Command) -> CommandInfo {
    let name = command.name.to_lowercase();

    if SPECIAL_SUBCOMMAND_COMMANDS.contains(&name.as_str()) {
        let subcommand = command
            .first_arg()
            .and_then(|a| std::str::from_utf8(a).ok())
            .map(|s| s.to_lowercase())
            .unwrap_or_default();
        return special_subcommand_info(&name, &subcommand);
    }

    top_level_info(&name).unwrap_or(SINGLE_RW)
}

/// Returns the slot-determining key byte-string, or `None` if the command
/// has no derivable key (spec.md §4.2 `extract_first_key`).
pub fn extract_first_key(command: &Command) -> Option<bytes::Bytes> {
    let info = classify(command);
    if info.first_key_index == usize::MAX {
        return None;
    }
    command.args.get(info.first_key_index).cloned()
}

/// True when `command` may only be served by a primary: either the command
/// is not classified read-only, or replica use has been disabled in config
/// (spec.md §4.2).
pub fn should_send_to_primary(command: &Command, replica_enabled: bool) -> bool {
    !replica_enabled || !classify(command).read_only
}
