//! Applies a configuration to the server and restarts it.
//!
//! Values are persisted with `ALTER SYSTEM`, one knob at a time. A knob that
//! fails to apply is logged and skipped; the rest still go through. The
//! restart afterwards is what makes the values effective, and it is the only
//! step whose failure is fatal for the iteration.

use std::thread;
use std::time::Duration;

use crate::connection::{ConnectionManager, Connector, DbSession};
use crate::error::TuneError;
use crate::knobs::{Configuration, KnobCatalog, KnobSpec, KnobValue};
use crate::server::ServerControl;

/// Result of a completed apply-and-restart.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Every knob was persisted.
    Applied,
    /// The listed knobs could not be persisted; the server was restarted anyway.
    Degraded { failed_knobs: Vec<String> },
}

impl ApplyOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, ApplyOutcome::Degraded { .. })
    }
}

/// Builds the `ALTER SYSTEM` statement for one already-coerced value.
///
/// Knob names are validated as identifiers when the catalog is loaded.
pub fn alter_system_sql(spec: &KnobSpec, value: KnobValue) -> String {
    format!("ALTER SYSTEM SET {} = '{}'", spec.name, value)
}

pub struct ConfigApplier<C: Connector> {
    connections: ConnectionManager<C>,
    restart_grace: Duration,
}

impl<C: Connector> ConfigApplier<C> {
    pub fn new(connections: ConnectionManager<C>, restart_grace: Duration) -> Self {
        Self {
            connections,
            restart_grace,
        }
    }

    /// Persists every knob of `config`, then restarts the server.
    ///
    /// Returns [`TuneError::RestartFailed`] when the server cannot be brought
    /// back up; every other failure short of losing the connection is folded
    /// into [`ApplyOutcome::Degraded`].
    pub fn apply(
        &self,
        catalog: &KnobCatalog,
        config: &Configuration,
    ) -> anyhow::Result<ApplyOutcome> {
        let resolved = catalog.resolve(config)?;
        let mut session = self.connections.connect()?;
        let mut failed_knobs = Vec::new();

        for (spec, value) in resolved {
            let sql = alter_system_sql(spec, value);
            match session.execute_utility(&sql) {
                Ok(()) => tracing::debug!(knob = %spec.name, %value, "knob persisted"),
                Err(err) => {
                    tracing::warn!(
                        knob = %spec.name,
                        %value,
                        error = %format!("{err:#}"),
                        "failed to persist knob"
                    );
                    failed_knobs.push(spec.name.clone());
                }
            }
        }
        drop(session);

        self.restart()?;

        if failed_knobs.is_empty() {
            tracing::info!(knobs = config.len(), "configuration applied");
            Ok(ApplyOutcome::Applied)
        } else {
            tracing::warn!(failed = failed_knobs.len(), "configuration partially applied");
            Ok(ApplyOutcome::Degraded { failed_knobs })
        }
    }

    /// Stops the server, waits out the grace period and starts it again.
    ///
    /// A failed start is remediated once by removing the override file.
    pub fn restart(&self) -> anyhow::Result<()> {
        let server = self.connections.server();
        if let Err(err) = server.stop() {
            // An already-stopped server is fine; start decides the outcome.
            tracing::warn!(error = %format!("{err:#}"), "server stop failed");
        }
        thread::sleep(self.restart_grace);

        let first_err = match server.start() {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        tracing::error!(
            error = %format!("{first_err:#}"),
            "server start failed; removing override file and retrying"
        );
        restart_after_override_removal(server.as_ref(), first_err)
    }
}

fn restart_after_override_removal(
    server: &dyn ServerControl,
    first_err: anyhow::Error,
) -> anyhow::Result<()> {
    if let Err(err) = server.remove_override_file() {
        tracing::error!(error = %format!("{err:#}"), "override-file removal failed");
    }
    server.start().map_err(|retry_err| {
        TuneError::RestartFailed(format!("{first_err:#}; retry: {retry_err:#}")).into()
    })
}
