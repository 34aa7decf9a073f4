//! Database sessions and the retrying connection manager.
//!
//! Every component that talks to the server goes through [`ConnectionManager::connect`],
//! which returns a freshly opened session owned by the caller. Sessions are
//! never pooled: a workload run opens one per worker and drops them when the
//! run ends.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use anyhow::Context;

use crate::error::TuneError;
use crate::server::ServerControl;

/// Minimal statement interface used by the tuner.
pub trait DbSession: Send {
    /// Runs `sql` inside the session's current transaction, opening one if needed.
    fn execute(&mut self, sql: &str) -> anyhow::Result<()>;

    /// Commits the open transaction, if any.
    fn commit(&mut self) -> anyhow::Result<()>;

    /// Runs `sql` outside any transaction block (`ALTER SYSTEM`, stat resets).
    fn execute_utility(&mut self, sql: &str) -> anyhow::Result<()>;

    /// Runs a read-only query and returns every row as text columns.
    fn query_text(&mut self, sql: &str) -> anyhow::Result<Vec<Vec<Option<String>>>>;

    /// Handle that can abort this session's in-flight statement from another
    /// thread. Sessions without out-of-band cancellation return `None`.
    fn canceller(&self) -> Option<Box<dyn QueryCanceller>> {
        None
    }
}

/// Cancels whatever statement a session is currently running.
pub trait QueryCanceller: Send {
    fn cancel(&self) -> anyhow::Result<()>;
}

/// Opens new sessions against the target server.
pub trait Connector: Send + Sync {
    type Session: DbSession + 'static;

    fn connect(&self) -> anyhow::Result<Self::Session>;
}

/// Connection parameters for the target PostgreSQL server.
#[derive(Debug, Clone)]
pub struct PgConnectParams {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub connect_timeout: Duration,
}

/// [`Connector`] backed by the synchronous `postgres` client.
#[derive(Debug, Clone)]
pub struct PgConnector {
    params: PgConnectParams,
}

impl PgConnector {
    pub fn new(params: PgConnectParams) -> Self {
        Self { params }
    }
}

impl Connector for PgConnector {
    type Session = PgSession;

    fn connect(&self) -> anyhow::Result<PgSession> {
        let p = &self.params;
        let mut config = postgres::Config::new();
        config
            .host(&p.host)
            .port(p.port)
            .dbname(&p.database)
            .user(&p.user)
            .connect_timeout(p.connect_timeout);
        if !p.password.is_empty() {
            config.password(&p.password);
        }
        let client = config
            .connect(postgres::NoTls)
            .with_context(|| format!("connect to {}:{}/{}", p.host, p.port, p.database))?;
        Ok(PgSession {
            client,
            in_transaction: false,
        })
    }
}

/// One open PostgreSQL connection.
pub struct PgSession {
    client: postgres::Client,
    in_transaction: bool,
}

impl DbSession for PgSession {
    fn execute(&mut self, sql: &str) -> anyhow::Result<()> {
        if !self.in_transaction {
            self.client.batch_execute("BEGIN").context("begin")?;
            self.in_transaction = true;
        }
        self.client.batch_execute(sql)?;
        Ok(())
    }

    fn commit(&mut self) -> anyhow::Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.client.batch_execute("COMMIT").context("commit")
    }

    fn execute_utility(&mut self, sql: &str) -> anyhow::Result<()> {
        self.commit()?;
        self.client.batch_execute(sql)?;
        Ok(())
    }

    fn query_text(&mut self, sql: &str) -> anyhow::Result<Vec<Vec<Option<String>>>> {
        let messages = self.client.simple_query(sql)?;
        let mut rows = Vec::new();
        for message in messages {
            if let postgres::SimpleQueryMessage::Row(row) = message {
                rows.push(
                    (0..row.len())
                        .map(|idx| row.get(idx).map(str::to_string))
                        .collect(),
                );
            }
        }
        Ok(rows)
    }

    fn canceller(&self) -> Option<Box<dyn QueryCanceller>> {
        Some(Box::new(PgCanceller(self.client.cancel_token())))
    }
}

struct PgCanceller(postgres::CancelToken);

impl QueryCanceller for PgCanceller {
    fn cancel(&self) -> anyhow::Result<()> {
        self.0
            .cancel_query(postgres::NoTls)
            .context("send cancel request")
    }
}

/// Retry and recovery timing for [`ConnectionManager`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Ordinary attempts before recovery kicks in.
    pub max_attempts: u32,
    /// Delay between ordinary attempts.
    pub backoff: Duration,
    /// Delay after removing the override file, before the final attempt.
    pub recovery_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(5),
            recovery_wait: Duration::from_secs(10),
        }
    }
}

/// States of one [`ConnectionManager::connect`] call.
enum ConnectState<S> {
    Connecting,
    Retrying(anyhow::Error),
    Recovering(anyhow::Error),
    FinalAttempt,
    Connected(S),
    Failed(anyhow::Error),
}

/// Hands out live sessions, retrying and recovering as needed.
///
/// Clones share the connector, the server handle and the recovery lock, so at
/// most one override-file recovery is in flight for the instance no matter
/// how many components hold a manager.
pub struct ConnectionManager<C: Connector> {
    connector: Arc<C>,
    server: Arc<dyn ServerControl>,
    policy: RetryPolicy,
    recovery_lock: Arc<Mutex<()>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            connector: Arc::clone(&self.connector),
            server: Arc::clone(&self.server),
            policy: self.policy,
            recovery_lock: Arc::clone(&self.recovery_lock),
        }
    }
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, server: Arc<dyn ServerControl>, policy: RetryPolicy) -> Self {
        Self {
            connector: Arc::new(connector),
            server,
            policy,
            recovery_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn server(&self) -> &Arc<dyn ServerControl> {
        &self.server
    }

    /// Returns a live session or [`TuneError::ConnectExhausted`].
    pub fn connect(&self) -> anyhow::Result<C::Session> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts = 0u32;
        let mut recovery_guard: Option<MutexGuard<'_, ()>> = None;
        let mut state = ConnectState::Connecting;
        loop {
            state = match state {
                ConnectState::Connecting => {
                    attempts += 1;
                    match self.connector.connect() {
                        Ok(session) => ConnectState::Connected(session),
                        Err(err) if attempts < max_attempts => ConnectState::Retrying(err),
                        Err(err) => ConnectState::Recovering(err),
                    }
                }
                ConnectState::Retrying(err) => {
                    tracing::warn!(
                        attempt = attempts,
                        max_attempts,
                        error = %format!("{err:#}"),
                        "connection attempt failed; retrying"
                    );
                    thread::sleep(self.policy.backoff);
                    ConnectState::Connecting
                }
                ConnectState::Recovering(err) => {
                    tracing::error!(
                        attempts,
                        error = %format!("{err:#}"),
                        "connection attempts exhausted; removing override file"
                    );
                    recovery_guard = Some(
                        self.recovery_lock
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner()),
                    );
                    if let Err(err) = self.server.remove_override_file() {
                        tracing::error!(error = %format!("{err:#}"), "override-file removal failed");
                    }
                    thread::sleep(self.policy.recovery_wait);
                    ConnectState::FinalAttempt
                }
                ConnectState::FinalAttempt => {
                    attempts += 1;
                    match self.connector.connect() {
                        Ok(session) => ConnectState::Connected(session),
                        Err(err) => ConnectState::Failed(err),
                    }
                }
                ConnectState::Connected(session) => {
                    if attempts > 1 {
                        tracing::info!(attempts, "connected after retry");
                    }
                    return Ok(session);
                }
                ConnectState::Failed(err) => {
                    drop(recovery_guard.take());
                    return Err(TuneError::ConnectExhausted {
                        attempts,
                        last_error: format!("{err:#}"),
                    }
                    .into());
                }
            };
        }
    }
}
