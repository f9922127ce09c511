//! Persisted task state.
//!
//! After every stage run the zone's task is written to a small per-zone
//! file, so that a restart resumes the pipeline where it left off instead
//! of re-reading and re-signing every zone from scratch.  The format is a
//! line-oriented key-value file bracketed by a magic marker; any anomaly
//! makes recovery fall back to a fresh read of the zone, which is always
//! safe.

use std::fs;
use std::str::FromStr;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use domain::base::name::Name;
use tracing::{debug, warn};

use crate::common::datetime::UnixTime;
use crate::scheduler::task::{Stage, Task};
use crate::util::write_file;
use crate::zone::ZoneKey;

/// Brackets the backup contents; a missing marker means a torn write.
const MAGIC: &str = ";;signerd-v1;;";

/// The backup file for a zone.
fn backup_path(dir: &Utf8Path, zone: &ZoneKey) -> Utf8PathBuf {
    dir.join(format!("{}.task", zone.name))
}

//----------- write ------------------------------------------------------------

/// Persist a zone's task to its backup file.
///
/// The write is atomic (temporary file plus rename), so a crash leaves
/// either the old backup or the new one, never a mix.
pub fn write(dir: &Utf8Path, task: &Task) -> std::io::Result<()> {
    let contents = format!(
        "{MAGIC}\n\
         ;who: {}\n\
         ;what: {}\n\
         ;when: {}\n\
         ;flush: {}\n\
         ;backoff: {}\n\
         {MAGIC}\n",
        task.zone.name,
        task.stage.to_int(),
        task.when.as_secs(),
        if task.flush { 1 } else { 0 },
        task.backoff,
    );
    write_file(&backup_path(dir, &task.zone), contents.as_bytes())
}

//----------- recover ----------------------------------------------------------

/// Load a zone's task from its backup file, if a valid one exists.
///
/// Returns `None` when there is no backup or it cannot be trusted; the
/// caller then starts the zone from a fresh read.  A backup recording a
/// stage this build does not know falls back to a read task due now.
pub fn recover(dir: &Utf8Path, zone: &ZoneKey, now: UnixTime) -> Option<Task> {
    let path = backup_path(dir, zone);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!("unable to read task backup '{path}': {err}");
            return None;
        }
    };

    let mut lines = contents.lines();
    let mut field = |prefix: &str| -> Option<&str> {
        let line = lines.next()?;
        line.strip_prefix(prefix)
    };

    if field(MAGIC) != Some("") {
        warn!("corrupt task backup '{path}': missing leading marker");
        return None;
    }
    let Some(who) = field(";who: ") else {
        warn!("corrupt task backup '{path}': missing zone name");
        return None;
    };
    // Compare names through the parser so trailing-dot differences do not
    // reject an otherwise matching backup.
    if Name::<Bytes>::from_str(who).ok().as_ref() != Some(&zone.name) {
        warn!("task backup '{path}' is for zone '{who}', not '{}'", zone.name);
        return None;
    }
    let Some(what) = field(";what: ").and_then(|s| s.parse::<u8>().ok()) else {
        warn!("corrupt task backup '{path}': bad stage");
        return None;
    };
    let Some(when) = field(";when: ").and_then(|s| s.parse::<u64>().ok()) else {
        warn!("corrupt task backup '{path}': bad due time");
        return None;
    };
    let Some(flush) = field(";flush: ").and_then(|s| match s {
        "0" => Some(false),
        "1" => Some(true),
        _ => None,
    }) else {
        warn!("corrupt task backup '{path}': bad flush marker");
        return None;
    };
    let Some(backoff) = field(";backoff: ").and_then(|s| s.parse::<u64>().ok()) else {
        warn!("corrupt task backup '{path}': bad backoff");
        return None;
    };
    if field(MAGIC) != Some("") {
        warn!("corrupt task backup '{path}': missing trailing marker");
        return None;
    }

    let Some(stage) = Stage::from_int(what) else {
        warn!(
            "task backup '{path}' records unknown stage {what}; \
             re-reading zone '{}'",
            zone.name
        );
        return Some(Task::new(Stage::Read, now, zone.clone()));
    };

    debug!("recovered task [{stage} zone '{}'] from backup", zone.name);
    let mut task = Task::new(stage, UnixTime::from_secs(when), zone.clone());
    task.flush = flush;
    task.backoff = backoff;
    Some(task)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(name: &str) -> ZoneKey {
        ZoneKey::from_str_in(name).unwrap()
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();
        let now = UnixTime::from_secs(2_000_000_000);

        let mut task = Task::new(Stage::Audit, UnixTime::from_secs(1_700_000_000), zone("example.com"));
        task.backoff = 64;
        write(dir, &task).unwrap();

        let recovered = recover(dir, &zone("example.com"), now).unwrap();
        assert_eq!(recovered.stage, Stage::Audit);
        assert_eq!(recovered.when, UnixTime::from_secs(1_700_000_000));
        assert_eq!(recovered.backoff, 64);
        assert!(!recovered.flush);
    }

    #[test]
    fn missing_backup_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();
        assert!(recover(dir, &zone("example.com"), UnixTime::from_secs(0)).is_none());
    }

    #[test]
    fn corrupt_backup_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();
        let now = UnixTime::from_secs(0);
        let path = dir.join("example.com.task");

        // Truncated file.
        fs::write(&path, format!("{MAGIC}\n;who: example.com\n")).unwrap();
        assert!(recover(dir, &zone("example.com"), now).is_none());

        // Wrong zone.
        let task = Task::new(Stage::Sign, UnixTime::from_secs(100), zone("other.example"));
        write(dir, &task).unwrap();
        fs::rename(dir.join("other.example.task"), &path).unwrap();
        assert!(recover(dir, &zone("example.com"), now).is_none());

        // Garbage stage number.
        fs::write(
            &path,
            format!(
                "{MAGIC}\n;who: example.com\n;what: banana\n;when: 100\n\
                 ;flush: 0\n;backoff: 0\n{MAGIC}\n"
            ),
        )
        .unwrap();
        assert!(recover(dir, &zone("example.com"), now).is_none());
    }

    #[test]
    fn unknown_stage_falls_back_to_read() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();
        let now = UnixTime::from_secs(12345);
        let path = dir.join("example.com.task");

        fs::write(
            &path,
            format!(
                "{MAGIC}\n;who: example.com\n;what: 99\n;when: 100\n\
                 ;flush: 0\n;backoff: 8\n{MAGIC}\n"
            ),
        )
        .unwrap();

        let task = recover(dir, &zone("example.com"), now).unwrap();
        assert_eq!(task.stage, Stage::Read);
        assert_eq!(task.when, now);
        assert_eq!(task.backoff, 0);
    }
}
