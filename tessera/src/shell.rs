//! Line commands of the interactive shell.
use std::str::FromStr;

use tessera_router::RouterError;
use tessera_shard::{RecordId, ShardId, ShardKey};
use tracing::Level;

use crate::cluster::Cluster;
use crate::demo::{HealthService, UserService};
use crate::entity::HealthRecord;

/// Shell errors. None of them end the session.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    /// Malformed command line.
    #[error("usage: {0}")]
    Usage(&'static str),
    /// First word is not a command.
    #[error("unknown command {0:?}, try `help`")]
    Unknown(String),
    /// The router refused or failed.
    #[error(transparent)]
    Router(#[from] RouterError),
    /// Output could not be rendered.
    #[error("render: {0}")]
    Render(String),
}

/// One parsed shell line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `insert <user> <level> <remark...>`
    Insert {
        /// Owner.
        user_id: i64,
        /// Health level.
        level_id: i32,
        /// Rest of the line.
        remark: String,
    },
    /// `get <id>`
    Get(RecordId),
    /// `list`
    List,
    /// `move <id> <from-user> <to-user>`
    Move {
        /// Record to move.
        id: RecordId,
        /// Current user.
        from: i64,
        /// New user.
        to: i64,
    },
    /// `delete <id> <user>`
    Delete {
        /// Record to delete.
        id: RecordId,
        /// Its user.
        user_id: i64,
    },
    /// `resolve <key>`
    Resolve(ShardKey),
    /// `seed`
    Seed,
    /// `reconcile`
    Reconcile,
    /// `down <shard>` / `up <shard>`
    Availability {
        /// Target shard.
        shard: ShardId,
        /// New state.
        up: bool,
    },
    /// `metrics`
    Metrics,
    /// `log <level>`
    Log(Level),
    /// `help`
    Help,
}

/// Help text.
pub const HELP: &str = "\
insert <user> <level> <remark>   add a health record
get <id>                         look a record up by id
list                             all records by id, then all users
move <id> <from> <to>            change a record's user
delete <id> <user>               remove a record
resolve <key>                    shard owning a key
seed                             add six users and eleven records
reconcile                        audit placement
down <shard> | up <shard>        toggle shard availability
metrics                          prometheus metrics
log <level>                      change the log level
exit                             leave";

/// Integer keys route as integers, anything else as text.
pub fn parse_key(raw: &str) -> ShardKey {
    raw.parse::<i64>().map(ShardKey::Int).unwrap_or_else(|_| ShardKey::from(raw))
}

fn arg<T: FromStr>(word: Option<&str>, usage: &'static str) -> Result<T, ShellError> {
    word.and_then(|w| w.parse().ok()).ok_or(ShellError::Usage(usage))
}

impl FromStr for Command {
    type Err = ShellError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(cmd) = words.next() else {
            return Err(ShellError::Usage("help"));
        };
        let cmd = match cmd.to_ascii_lowercase().as_str() {
            "insert" => {
                const U: &str = "insert <user> <level> <remark>";
                let user_id = arg(words.next(), U)?;
                let level_id = arg(words.next(), U)?;
                let remark = words.collect::<Vec<_>>().join(" ");
                Command::Insert { user_id, level_id, remark }
            }
            "get" => Command::Get(RecordId(arg(words.next(), "get <id>")?)),
            "list" => Command::List,
            "move" => {
                const U: &str = "move <id> <from> <to>";
                Command::Move { id: RecordId(arg(words.next(), U)?), from: arg(words.next(), U)?, to: arg(words.next(), U)? }
            }
            "delete" => {
                const U: &str = "delete <id> <user>";
                Command::Delete { id: RecordId(arg(words.next(), U)?), user_id: arg(words.next(), U)? }
            }
            "resolve" => Command::Resolve(parse_key(words.next().ok_or(ShellError::Usage("resolve <key>"))?)),
            "seed" => Command::Seed,
            "reconcile" => Command::Reconcile,
            "down" => Command::Availability { shard: ShardId(arg(words.next(), "down <shard>")?), up: false },
            "up" => Command::Availability { shard: ShardId(arg(words.next(), "up <shard>")?), up: true },
            "metrics" => Command::Metrics,
            "log" => Command::Log(arg(words.next(), "log <trace|debug|info|warn|error>")?),
            "help" | "?" => Command::Help,
            other => return Err(ShellError::Unknown(other.to_owned())),
        };
        Ok(cmd)
    }
}

/// Shell state: the cluster and the health tables on it.
pub struct Shell {
    cluster: Cluster,
    service: HealthService,
    users: UserService,
    log: Option<tessera_log::ReloadHandle>,
}

impl Shell {
    /// Shell over `cluster`. `log` enables the `log` command.
    pub fn new(cluster: Cluster, log: Option<tessera_log::ReloadHandle>) -> Self {
        let service = HealthService::new(&cluster);
        let users = UserService::new(&cluster);
        Self { cluster, service, users, log }
    }

    /// Run one command and render its output.
    pub async fn execute(&self, cmd: Command) -> Result<String, ShellError> {
        let out = match cmd {
            Command::Insert { user_id, level_id, remark } => {
                let mut record = HealthRecord::new(user_id, level_id, remark);
                let id = self.service.records().insert(&mut record).await?;
                format!("inserted {id} into {}", self.service.records().shard_of(&user_id)?)
            }
            Command::Get(id) => match self.service.records().query_by_id(id).await? {
                Some(record) => json(&record)?,
                None => format!("{id} not found"),
            },
            Command::List => {
                let records = self.service.query_all().await?;
                let mut out: Vec<String> = records.iter().map(json).collect::<Result<_, _>>()?;
                out.push(format!("({} records)", records.len()));
                let users = self.users.find_all().await?;
                for user in &users {
                    out.push(json(user)?);
                }
                out.push(format!("({} users)", users.len()));
                out.join("\n")
            }
            Command::Move { id, from, to } => json(&self.service.reassign(id, from, to).await?)?,
            Command::Delete { id, user_id } => {
                self.service.records().delete(id, &user_id).await?;
                format!("deleted {id}")
            }
            Command::Resolve(key) => {
                let shard = self.cluster.directory().resolve(&key).map_err(RouterError::from)?;
                format!("{key} -> {shard}")
            }
            Command::Seed => {
                let users = self.users.process_users().await?;
                let seeded = self.service.process_health_records().await?;
                format!("seeded {} users and {} records", users.len(), seeded.len())
            }
            Command::Reconcile => json(&self.service.records().reconcile().await?)?,
            Command::Availability { shard, up } => {
                if !self.cluster.directory().contains(shard) {
                    return Err(ShellError::Usage("shard not in topology"));
                }
                self.cluster.executor().set_unavailable(shard, !up);
                format!("{shard} {}", if up { "up" } else { "down" })
            }
            Command::Metrics => tessera_router::metrics::render().map_err(|e| ShellError::Render(e.to_string()))?,
            Command::Log(level) => match &self.log {
                Some(handle) => {
                    tessera_log::set_level(handle, level).map_err(|e| ShellError::Render(e.to_string()))?;
                    format!("log level {level}")
                }
                None => "logging not initialized".to_owned(),
            },
            Command::Help => HELP.to_owned(),
        };
        Ok(out)
    }
}

fn json<T: serde::Serialize>(value: &T) -> Result<String, ShellError> {
    serde_json::to_string(value).map_err(|e| ShellError::Render(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TesseraConfig;

    fn shell() -> Shell {
        Shell::new(Cluster::from_config(&TesseraConfig::default()).unwrap(), None)
    }

    #[test]
    fn parses_commands() {
        assert_eq!(
            "insert 4 2 feeling fine".parse::<Command>().unwrap(),
            Command::Insert { user_id: 4, level_id: 2, remark: "feeling fine".into() }
        );
        assert_eq!(
            "MOVE 7 4 5".parse::<Command>().unwrap(),
            Command::Move { id: RecordId(7), from: 4, to: 5 }
        );
        assert_eq!("resolve abc".parse::<Command>().unwrap(), Command::Resolve(ShardKey::Text("abc".into())));
        assert_eq!("resolve 12".parse::<Command>().unwrap(), Command::Resolve(ShardKey::Int(12)));
        assert_eq!("log debug".parse::<Command>().unwrap(), Command::Log(Level::DEBUG));
        assert!(matches!("get x".parse::<Command>(), Err(ShellError::Usage(_))));
        assert!(matches!("frobnicate".parse::<Command>(), Err(ShellError::Unknown(_))));
    }

    #[tokio::test]
    async fn insert_move_and_reconcile() {
        let shell = shell();
        let out = shell.execute("insert 4 1 ok".parse().unwrap()).await.unwrap();
        assert!(out.ends_with("shard_0"), "{out}");
        let id: u64 = out.split_whitespace().nth(1).unwrap().parse().unwrap();

        let moved = shell.execute(Command::Move { id: RecordId(id), from: 4, to: 5 }).await.unwrap();
        assert!(moved.contains("\"moved\":true"), "{moved}");
        let audit = shell.execute(Command::Reconcile).await.unwrap();
        assert!(audit.contains("\"duplicates\":[]"), "{audit}");
        assert_eq!(shell.execute(Command::Resolve(ShardKey::Int(5))).await.unwrap(), "5 -> shard_1");
        let metrics = shell.execute(Command::Metrics).await.unwrap();
        assert!(metrics.contains("tessera_routed_statements_total"));
        assert!(metrics.contains("tessera_relocations_total"));
    }

    #[tokio::test]
    async fn down_shard_surfaces_errors() {
        let shell = shell();
        shell.execute(Command::Seed).await.unwrap();
        shell.execute(Command::Availability { shard: ShardId(1), up: false }).await.unwrap();
        assert!(matches!(shell.execute(Command::List).await, Err(ShellError::Router(_))));
        shell.execute(Command::Availability { shard: ShardId(1), up: true }).await.unwrap();
        let listed = shell.execute(Command::List).await.unwrap();
        assert!(listed.contains("(11 records)"), "{listed}");
        assert!(listed.ends_with("(6 users)"), "{listed}");
        assert!(listed.contains("\"userName3\""));
        assert!(matches!(
            shell.execute(Command::Availability { shard: ShardId(9), up: true }).await,
            Err(ShellError::Usage(_))
        ));
    }
}
