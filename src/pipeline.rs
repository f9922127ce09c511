//! The signing pipeline.
//!
//! A zone moves through a fixed chain of stages: read the unsigned input,
//! add DNSKEY records, add denial-of-existence records, sign, optionally
//! audit, and write the signed output.  [`drive`] executes that chain for
//! one task, running every stage from the task's starting point onwards in
//! a single pass.  The stages themselves are behind the [`ZoneTools`]
//! trait; the production implementation shells out to configured commands.

use std::fmt;
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::common::datetime::UnixTime;
use crate::scheduler::task::{next_backoff, Stage, Task};
use crate::zone::signconf::SignConf;
use crate::zone::{ZoneKey, ZoneState};

/// How long to wait before the next run when no resign interval is set.
const DEFAULT_RESIGN_SECS: u64 = 3600;

//----------- ZoneTools --------------------------------------------------------

/// The per-stage operations of the signing pipeline.
///
/// Implementations must be callable from any worker thread.  Each method
/// either completes its stage or reports why it could not; partial effects
/// are the implementation's problem to avoid, as a failed stage will simply
/// be retried later.
pub trait ZoneTools: Send + Sync {
    /// Load the unsigned zone from its inbound adapter.
    fn read_input(&self, input: &StageInput<'_>) -> Result<(), StageError>;

    /// Insert the DNSKEY records for the zone's current keys.
    fn add_dnskeys(&self, input: &StageInput<'_>) -> Result<(), StageError>;

    /// Add NSEC or NSEC3 denial-of-existence records.
    fn nsecify(&self, input: &StageInput<'_>) -> Result<(), StageError>;

    /// Generate RRSIG records.
    fn sign(&self, input: &StageInput<'_>) -> Result<(), StageError>;

    /// Verify the signed zone before publication.
    fn audit(&self, input: &StageInput<'_>) -> Result<(), StageError>;

    /// Write the signed zone to its outbound adapter.
    fn write_output(&self, input: &StageInput<'_>) -> Result<(), StageError>;
}

//----------- StageInput -------------------------------------------------------

/// Everything a stage gets to work with.
pub struct StageInput<'a> {
    /// The zone being processed.
    pub zone: &'a ZoneKey,

    /// Where the unsigned zone comes from.
    pub inbound: Option<&'a crate::zone::adapter::Adapter>,

    /// Where the signed zone goes.
    pub outbound: Option<&'a crate::zone::adapter::Adapter>,

    /// The zone's signer configuration.
    pub signconf: &'a SignConf,

    /// The serial for the outbound SOA, once determined.
    pub serial: Option<u32>,
}

//----------- StageError -------------------------------------------------------

/// A failure in a pipeline stage.
#[derive(Debug)]
pub struct StageError {
    message: String,
}

impl StageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::error::Error for StageError {}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

//----------- Outcome ----------------------------------------------------------

/// The result of driving a task through the pipeline.
#[derive(Debug)]
pub enum Outcome {
    /// Every stage ran; the task is reset for the next resign cycle.
    Completed,

    /// A stage failed; the task retries it after a backoff.
    Failed {
        stage: Stage,
        error: StageError,
    },

    /// Nothing to do; the task should not be rescheduled.
    Skipped,
}

//----------- drive ------------------------------------------------------------

/// Run a task's stage and every stage after it.
///
/// On success the task is rewound to [`Stage::Sign`] and scheduled one
/// resign interval ahead, with backoff cleared.  On failure the task stays
/// at the failed stage, backed off exponentially, except that a failed
/// audit retries from [`Stage::Sign`] so the auditor sees freshly signed
/// data.  The task in both cases is ready to be handed back to the
/// scheduler; only [`Outcome::Skipped`] means it should be dropped.
pub fn drive(
    task: &mut Task,
    state: &mut ZoneState,
    tools: &dyn ZoneTools,
    now: UnixTime,
) -> Outcome {
    if task.stage == Stage::None {
        warn!("zone '{}' has nothing to do", task.zone);
        return Outcome::Skipped;
    }
    let Some(signconf) = state.signconf.clone() else {
        warn!(
            "zone '{}' has no signer configuration, skipping",
            task.zone
        );
        return Outcome::Skipped;
    };

    let zone = task.zone.clone();
    let inbound = state.inbound.clone();
    let outbound = state.outbound.clone();
    let mut input = StageInput {
        zone: &zone,
        inbound: inbound.as_ref(),
        outbound: outbound.as_ref(),
        signconf: &signconf,
        serial: None,
    };

    let mut stage = task.stage;
    loop {
        if stage == Stage::Write {
            // The outbound SOA serial is fixed just before writing.  A
            // policy violation is reported but does not block publication;
            // the zone goes out with its inbound serial.
            match state.next_outbound_serial(now) {
                Ok(serial) => input.serial = Some(serial),
                Err(err) => {
                    warn!("zone '{}': {err}", task.zone);
                }
            }
        }

        debug!("zone '{}': {} stage", task.zone, stage);
        let result = match stage {
            Stage::None => unreachable!("the chain starts past this stage"),
            Stage::Read => tools.read_input(&input),
            Stage::AddKeys => tools.add_dnskeys(&input),
            Stage::Nsecify => tools.nsecify(&input),
            Stage::Sign => tools.sign(&input),
            Stage::Audit => tools.audit(&input),
            Stage::Write => tools.write_output(&input),
        };

        if let Err(error) = result {
            // A failed audit means the signed data could not be trusted;
            // retrying the audit alone would just re-check the same data,
            // so the retry re-signs first.
            task.stage = if stage == Stage::Audit {
                Stage::Sign
            } else {
                stage
            };
            task.backoff = next_backoff(task.backoff);
            task.when = now + task.backoff;
            state.backoff = task.backoff;
            return Outcome::Failed { stage, error };
        }

        if stage == Stage::Write {
            if let Some(serial) = input.serial {
                state.outbound_serial = serial;
            }
        }
        stage = match stage.next() {
            Some(next) => next,
            None => break,
        };
    }

    let resign = signconf
        .resign
        .map_or(DEFAULT_RESIGN_SECS, |span| u64::from(span.as_secs()));
    task.stage = Stage::Sign;
    task.when = now + resign;
    task.backoff = 0;
    state.backoff = 0;
    info!(
        "zone '{}' processed, next run {}",
        task.zone, task.when
    );
    Outcome::Completed
}

//----------- CommandTools -----------------------------------------------------

/// Per-stage external commands.
///
/// Each stage runs its configured command through the shell, with the
/// zone's particulars passed in the environment.  A stage without a
/// command is a no-op, so a minimal setup only needs `sign` and the
/// adapters.  The audit command additionally only runs for zones whose
/// signer configuration asks for an audit.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct StageCommands {
    pub read: Option<String>,
    pub add_keys: Option<String>,
    pub nsecify: Option<String>,
    pub sign: Option<String>,
    pub audit: Option<String>,
    pub write: Option<String>,
}

/// [`ZoneTools`] backed by [`StageCommands`].
#[derive(Debug)]
pub struct CommandTools {
    commands: StageCommands,
}

impl CommandTools {
    pub fn new(commands: StageCommands) -> Self {
        Self { commands }
    }

    fn run(
        &self,
        stage: Stage,
        command: Option<&String>,
        input: &StageInput<'_>,
    ) -> Result<(), StageError> {
        let Some(command) = command else {
            return Ok(());
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .env("SIGNERD_ZONE", input.zone.name.to_string())
            .env("SIGNERD_CLASS", input.zone.class.to_string())
            .env("SIGNERD_STAGE", format!("{}", stage.to_int()));
        if let Some(inbound) = input.inbound {
            cmd.env("SIGNERD_INBOUND", inbound.path.as_str());
        }
        if let Some(outbound) = input.outbound {
            cmd.env("SIGNERD_OUTBOUND", outbound.path.as_str());
        }
        if let Some(serial) = input.serial {
            cmd.env("SIGNERD_SERIAL", serial.to_string());
        }

        let status = cmd.status()?;
        if status.success() {
            Ok(())
        } else {
            Err(StageError::new(format!(
                "command '{command}' exited with {status}"
            )))
        }
    }
}

impl ZoneTools for CommandTools {
    fn read_input(&self, input: &StageInput<'_>) -> Result<(), StageError> {
        self.run(Stage::Read, self.commands.read.as_ref(), input)
    }

    fn add_dnskeys(&self, input: &StageInput<'_>) -> Result<(), StageError> {
        self.run(Stage::AddKeys, self.commands.add_keys.as_ref(), input)
    }

    fn nsecify(&self, input: &StageInput<'_>) -> Result<(), StageError> {
        self.run(Stage::Nsecify, self.commands.nsecify.as_ref(), input)
    }

    fn sign(&self, input: &StageInput<'_>) -> Result<(), StageError> {
        self.run(Stage::Sign, self.commands.sign.as_ref(), input)
    }

    fn audit(&self, input: &StageInput<'_>) -> Result<(), StageError> {
        if !input.signconf.audit {
            return Ok(());
        }
        self.run(Stage::Audit, self.commands.audit.as_ref(), input)
    }

    fn write_output(&self, input: &StageInput<'_>) -> Result<(), StageError> {
        self.run(Stage::Write, self.commands.write.as_ref(), input)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::common::datetime::TimeSpan;
    use crate::scheduler::task::Task;
    use crate::zone::ZoneKey;

    /// Records the stages it runs and fails the ones it is told to.
    struct FakeTools {
        fail: Vec<Stage>,
        ran: Mutex<Vec<Stage>>,
    }

    impl FakeTools {
        fn new(fail: &[Stage]) -> Self {
            Self {
                fail: fail.to_vec(),
                ran: Mutex::new(Vec::new()),
            }
        }

        fn stage(&self, stage: Stage) -> Result<(), StageError> {
            self.ran.lock().unwrap().push(stage);
            if self.fail.contains(&stage) {
                Err(StageError::new(format!("{stage} refused")))
            } else {
                Ok(())
            }
        }
    }

    impl ZoneTools for FakeTools {
        fn read_input(&self, _: &StageInput<'_>) -> Result<(), StageError> {
            self.stage(Stage::Read)
        }
        fn add_dnskeys(&self, _: &StageInput<'_>) -> Result<(), StageError> {
            self.stage(Stage::AddKeys)
        }
        fn nsecify(&self, _: &StageInput<'_>) -> Result<(), StageError> {
            self.stage(Stage::Nsecify)
        }
        fn sign(&self, _: &StageInput<'_>) -> Result<(), StageError> {
            self.stage(Stage::Sign)
        }
        fn audit(&self, _: &StageInput<'_>) -> Result<(), StageError> {
            self.stage(Stage::Audit)
        }
        fn write_output(&self, _: &StageInput<'_>) -> Result<(), StageError> {
            self.stage(Stage::Write)
        }
    }

    fn setup(resign: u32) -> (Task, ZoneState) {
        let zone = ZoneKey::from_str_in("example.com").unwrap();
        let task = Task::new(Stage::Read, UnixTime::from_secs(1000), zone);
        let state = ZoneState {
            signconf: Some(SignConf {
                resign: Some(TimeSpan::from_secs(resign)),
                ..Default::default()
            }),
            ..Default::default()
        };
        (task, state)
    }

    #[test]
    fn successful_run_covers_every_stage() {
        let (mut task, mut state) = setup(7200);
        let tools = FakeTools::new(&[]);
        let now = UnixTime::from_secs(1000);

        let outcome = drive(&mut task, &mut state, &tools, now);
        assert!(matches!(outcome, Outcome::Completed));
        assert_eq!(
            *tools.ran.lock().unwrap(),
            vec![
                Stage::Read,
                Stage::AddKeys,
                Stage::Nsecify,
                Stage::Sign,
                Stage::Audit,
                Stage::Write,
            ]
        );
        assert_eq!(task.stage, Stage::Sign);
        assert_eq!(task.when, UnixTime::from_secs(1000 + 7200));
        assert_eq!(task.backoff, 0);
        assert_eq!(state.backoff, 0);
    }

    #[test]
    fn failure_backs_off_and_stays_on_the_stage() {
        let (mut task, mut state) = setup(7200);
        let tools = FakeTools::new(&[Stage::Sign]);
        let now = UnixTime::from_secs(1000);

        let outcome = drive(&mut task, &mut state, &tools, now);
        let Outcome::Failed { stage, .. } = outcome else {
            panic!("expected a failure");
        };
        assert_eq!(stage, Stage::Sign);
        assert_eq!(task.stage, Stage::Sign);
        assert_eq!(task.backoff, 1);
        assert_eq!(task.when, UnixTime::from_secs(1001));
        assert_eq!(state.backoff, 1);

        // A later retry that succeeds clears the backoff.
        let tools = FakeTools::new(&[]);
        let now = UnixTime::from_secs(1001);
        let outcome = drive(&mut task, &mut state, &tools, now);
        assert!(matches!(outcome, Outcome::Completed));
        assert_eq!(task.backoff, 0);
        assert_eq!(state.backoff, 0);
    }

    #[test]
    fn repeated_failures_grow_the_backoff() {
        let (mut task, mut state) = setup(7200);
        let tools = FakeTools::new(&[Stage::Read]);

        let mut expected = 0u64;
        for round in 0..15 {
            let now = UnixTime::from_secs(1000 + round);
            let outcome = drive(&mut task, &mut state, &tools, now);
            assert!(matches!(outcome, Outcome::Failed { .. }));
            expected = next_backoff(expected);
            assert_eq!(task.backoff, expected);
            assert_eq!(task.when, now + expected);
        }
        assert_eq!(task.backoff, 3600);
    }

    #[test]
    fn failed_audit_retries_from_sign() {
        let (mut task, mut state) = setup(7200);
        task.stage = Stage::Audit;
        let tools = FakeTools::new(&[Stage::Audit]);
        let now = UnixTime::from_secs(1000);

        let outcome = drive(&mut task, &mut state, &tools, now);
        let Outcome::Failed { stage, .. } = outcome else {
            panic!("expected a failure");
        };
        assert_eq!(stage, Stage::Audit);
        assert_eq!(task.stage, Stage::Sign);
        assert_eq!(task.backoff, 1);
    }

    #[test]
    fn idle_and_unconfigured_zones_are_skipped() {
        let zone = ZoneKey::from_str_in("example.com").unwrap();
        let now = UnixTime::from_secs(1000);
        let tools = FakeTools::new(&[]);

        let mut task = Task::new(Stage::None, now, zone.clone());
        let mut state = ZoneState::default();
        assert!(matches!(
            drive(&mut task, &mut state, &tools, now),
            Outcome::Skipped
        ));

        let mut task = Task::new(Stage::Sign, now, zone);
        let mut state = ZoneState::default();
        assert!(matches!(
            drive(&mut task, &mut state, &tools, now),
            Outcome::Skipped
        ));
        assert!(tools.ran.lock().unwrap().is_empty());
    }
}
