//! Backend adapter implementations.
//!
//! - `postgres`, `mysql`: sqlx pools (always built)
//! - `mongodb`: typed command documents
//! - `redis`: command lines on a multiplexed connection
//! - `oracle`: blocking OCI driver behind `spawn_blocking`
//! - `neo4j`: Cypher over Bolt
//! - `cassandra`: CQL via the scylla driver
//! - `dynamodb`: PartiQL and typed table operations

pub mod mysql;
pub mod postgres;
pub(crate) mod sql;

#[cfg(feature = "cassandra")]
pub mod cassandra;
#[cfg(feature = "dynamodb")]
pub mod dynamodb;
#[cfg(feature = "mongodb")]
pub mod mongodb;
#[cfg(feature = "neo4j")]
pub mod neo4j;
#[cfg(feature = "oracle")]
pub mod oracle;
#[cfg(feature = "redis")]
pub mod redis;

/// First keyword of a statement, uppercased, skipping leading comments and parentheses.
#[allow(dead_code)]
pub(crate) fn leading_keyword(statement: &str) -> String {
    let mut rest = statement.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map_or("", |(_, tail)| tail).trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, tail)| tail).trim_start();
        } else if let Some(after) = rest.strip_prefix('(') {
            rest = after.trim_start();
        } else {
            break;
        }
    }
    rest.split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .next()
        .unwrap_or("")
        .to_ascii_uppercase()
}
