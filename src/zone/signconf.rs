//! Per-zone signer configurations.
//!
//! A signer configuration (signconf) captures the signing policy for one
//! zone: signature timers, the denial-of-existence mechanism, the key list
//! and SOA handling.  Comparing an old and a new signconf decides which
//! pipeline stage has to be re-run; validating one decides whether it may
//! become active at all.

use std::fmt;
use std::fs;
use std::str::FromStr;
use std::time::UNIX_EPOCH;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::datetime::{TimeSpan, UnixTime};
use crate::scheduler::task::Stage;

//----------- SignConf ---------------------------------------------------------

/// A signer configuration for one zone.
///
/// All policy fields are optional until [`SignConf::check`] has passed; a
/// signconf only becomes active on a zone after a successful check, at which
/// point the required durations are known to be present.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignConf {
    /// How often the zone is re-signed.
    pub resign: Option<TimeSpan>,

    /// The age at which existing signatures are refreshed.
    pub refresh: Option<TimeSpan>,

    /// Validity period for ordinary signatures.
    pub validity_default: Option<TimeSpan>,

    /// Validity period for denial-of-existence signatures.
    pub validity_denial: Option<TimeSpan>,

    /// Random spread applied to signature expiration times.
    pub jitter: Option<TimeSpan>,

    /// How far signature inception is backdated.
    pub inception_offset: Option<TimeSpan>,

    /// The denial-of-existence mechanism.
    pub denial: Option<Denial>,

    /// TTL for DNSKEY records.
    pub dnskey_ttl: Option<TimeSpan>,

    /// The keys to sign with.
    pub keys: Vec<Key>,

    /// TTL for the SOA record.
    pub soa_ttl: Option<TimeSpan>,

    /// The SOA minimum field.
    pub soa_min: Option<TimeSpan>,

    /// The SOA serial policy; one of "keep", "counter", "unixtime" or
    /// "datecounter".
    pub soa_serial: Option<String>,

    /// Whether the signed zone is audited before being written out.
    pub audit: bool,

    /// Modification time of the file this was read from.
    pub last_modified: UnixTime,
}

impl SignConf {
    /// Validate that this signconf is complete enough to become active.
    ///
    /// All problems are reported, not just the first one found.
    pub fn check(&self) -> Result<(), Vec<SignConfError>> {
        let mut errors = Vec::new();

        if self.resign.is_none() {
            errors.push(SignConfError::MissingResignInterval);
        }
        if self.refresh.is_none() {
            errors.push(SignConfError::MissingRefreshInterval);
        }
        if self.validity_default.is_none() {
            errors.push(SignConfError::MissingValidityDefault);
        }
        if self.validity_denial.is_none() {
            errors.push(SignConfError::MissingValidityDenial);
        }
        if self.jitter.is_none() {
            errors.push(SignConfError::MissingJitter);
        }
        if self.inception_offset.is_none() {
            errors.push(SignConfError::MissingInceptionOffset);
        }

        match &self.denial {
            None => errors.push(SignConfError::MissingDenial),
            Some(Denial::Nsec) => {}
            Some(Denial::Nsec3(params)) => {
                if params.algorithm == 0 {
                    errors.push(SignConfError::MissingNsec3Algorithm);
                }
            }
        }

        if self.keys.is_empty() {
            errors.push(SignConfError::NoKeys);
        }
        if self.dnskey_ttl.is_none() {
            errors.push(SignConfError::MissingDnskeyTtl);
        }
        if self.soa_ttl.is_none() {
            errors.push(SignConfError::MissingSoaTtl);
        }
        if self.soa_min.is_none() {
            errors.push(SignConfError::MissingSoaMin);
        }
        match &self.soa_serial {
            None => errors.push(SignConfError::MissingSerialPolicy),
            Some(policy) if SerialPolicy::from_str(policy).is_err() => {
                errors.push(SignConfError::BadSerialPolicy(policy.clone()));
            }
            Some(_) => {}
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Which pipeline stage has to restart when `self` is replaced by `new`.
    ///
    /// Defaults to [`Stage::Sign`]: most changes (for instance the signature
    /// timers) only require a re-sign with the new parameters.  Changes that
    /// alter the shape of the zone data escalate to a full [`Stage::Read`]:
    /// a different denial-of-existence mechanism or NSEC3 parameters, a
    /// changed SOA minimum, or a different key list.
    pub fn compare(&self, new: &SignConf) -> Stage {
        if self.denial != new.denial {
            return Stage::Read;
        }
        if self.soa_min != new.soa_min {
            return Stage::Read;
        }
        if self.keys != new.keys {
            return Stage::Read;
        }
        Stage::Sign
    }
}

//----------- Denial -----------------------------------------------------------

/// The denial-of-existence mechanism of a signconf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Denial {
    Nsec,
    Nsec3(Nsec3Params),
}

/// Parameters for NSEC3 denial of existence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Nsec3Params {
    pub algorithm: u8,
    pub iterations: u16,
    pub salt: Option<String>,
    pub opt_out: bool,
}

//----------- Key --------------------------------------------------------------

/// A signing key reference.
///
/// The key material itself lives behind the HSM collaborator; the signconf
/// only carries the locator and role so that key-list changes are detected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Key {
    /// Where the HSM finds the key.
    pub locator: String,

    /// The DNSSEC algorithm number.
    pub algorithm: u8,

    /// The DNSKEY flags field.
    pub flags: u16,

    /// Whether the DNSKEY record is published.
    pub publish: bool,

    /// Whether the key signs the key set.
    pub ksk: bool,

    /// Whether the key signs the zone data.
    pub zsk: bool,
}

//----------- SerialPolicy -----------------------------------------------------

/// How the outbound SOA serial is derived.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SerialPolicy {
    /// Keep the serial from the unsigned zone.
    Keep,

    /// Count up from the inbound serial.
    Counter,

    /// The current Unix time.
    Unixtime,

    /// `YYYYMMDDxx`, a date with a two-digit counter.
    Datecounter,
}

impl FromStr for SerialPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep" => Ok(Self::Keep),
            "counter" => Ok(Self::Counter),
            "unixtime" => Ok(Self::Unixtime),
            "datecounter" => Ok(Self::Datecounter),
            other => Err(format!("unknown serial policy '{other}'")),
        }
    }
}

//----------- SignConfError ----------------------------------------------------

/// A problem found while checking a signconf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignConfError {
    MissingResignInterval,
    MissingRefreshInterval,
    MissingValidityDefault,
    MissingValidityDenial,
    MissingJitter,
    MissingInceptionOffset,
    MissingDenial,
    MissingNsec3Algorithm,
    NoKeys,
    MissingDnskeyTtl,
    MissingSoaTtl,
    MissingSoaMin,
    MissingSerialPolicy,
    BadSerialPolicy(String),
}

impl std::error::Error for SignConfError {}

impl fmt::Display for SignConfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingResignInterval => f.write_str("no signature resign interval found"),
            Self::MissingRefreshInterval => f.write_str("no signature refresh interval found"),
            Self::MissingValidityDefault => f.write_str("no signature default validity found"),
            Self::MissingValidityDenial => f.write_str("no signature denial validity found"),
            Self::MissingJitter => f.write_str("no signature jitter found"),
            Self::MissingInceptionOffset => f.write_str("no signature inception offset found"),
            Self::MissingDenial => f.write_str("no denial of existence mechanism found"),
            Self::MissingNsec3Algorithm => f.write_str("no nsec3 algorithm found"),
            Self::NoKeys => f.write_str("no keys found"),
            Self::MissingDnskeyTtl => f.write_str("no dnskey ttl found"),
            Self::MissingSoaTtl => f.write_str("no soa ttl found"),
            Self::MissingSoaMin => f.write_str("no soa minimum found"),
            Self::MissingSerialPolicy => f.write_str("no soa serial policy found"),
            Self::BadSerialPolicy(p) => write!(f, "wrong soa serial type '{p}'"),
        }
    }
}

//----------- Reading signconf files -------------------------------------------

/// An error reading a signconf file.
#[derive(Debug)]
pub enum ReadError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl std::error::Error for ReadError {}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => err.fmt(f),
            Self::Parse(err) => err.fmt(f),
        }
    }
}

impl From<std::io::Error> for ReadError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Read a signconf file, unless it is unchanged.
///
/// Returns `Ok(None)` if the file has not been modified since
/// `last_modified`.  The returned signconf has not been checked yet.
pub fn read(path: &Utf8Path, last_modified: UnixTime) -> Result<Option<SignConf>, ReadError> {
    let metadata = fs::metadata(path)?;
    let mtime = metadata
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| UnixTime::from_secs(d.as_secs()))
        .unwrap_or_default();
    if mtime <= last_modified {
        debug!("signconf file {path} is unchanged");
        return Ok(None);
    }

    let text = fs::read_to_string(path)?;
    let spec: Spec = toml::from_str(&text).map_err(ReadError::Parse)?;
    let mut signconf = spec.parse();
    signconf.last_modified = mtime;
    Ok(Some(signconf))
}

//----------- Spec -------------------------------------------------------------

/// A signconf file.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Spec {
    /// Signature timers.
    pub signatures: SignaturesSpec,

    /// Denial of existence.
    pub denial: Option<DenialSpec>,

    /// The key set.
    pub keys: KeysSpec,

    /// Source of authority.
    pub soa: SoaSpec,

    /// Whether to audit the signed zone before writing it out.
    pub audit: bool,
}

/// The `[signatures]` section of a signconf file.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct SignaturesSpec {
    pub resign: Option<TimeSpan>,
    pub refresh: Option<TimeSpan>,
    pub validity_default: Option<TimeSpan>,
    pub validity_denial: Option<TimeSpan>,
    pub jitter: Option<TimeSpan>,
    pub inception_offset: Option<TimeSpan>,
}

/// The `[denial]` section of a signconf file.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct DenialSpec {
    /// "nsec" or "nsec3".
    #[serde(rename = "type")]
    pub kind: Option<String>,

    pub algorithm: Option<u8>,
    pub iterations: Option<u16>,
    pub salt: Option<String>,
    pub opt_out: Option<bool>,
}

/// The `[keys]` section of a signconf file.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct KeysSpec {
    pub ttl: Option<TimeSpan>,

    #[serde(rename = "key")]
    pub keys: Vec<KeySpec>,
}

/// One `[[keys.key]]` entry.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct KeySpec {
    pub locator: String,
    pub algorithm: u8,
    pub flags: u16,
    pub publish: bool,
    pub ksk: bool,
    pub zsk: bool,
}

/// The `[soa]` section of a signconf file.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct SoaSpec {
    pub ttl: Option<TimeSpan>,
    pub minimum: Option<TimeSpan>,
    pub serial: Option<String>,
}

impl Spec {
    /// Parse from this specification.
    ///
    /// An unrecognized denial type parses as "no denial mechanism"; the
    /// subsequent check rejects the signconf with a clear error instead of
    /// this function guessing.
    pub fn parse(self) -> SignConf {
        let denial = self.denial.and_then(|spec| match spec.kind.as_deref() {
            Some("nsec") => Some(Denial::Nsec),
            Some("nsec3") => Some(Denial::Nsec3(Nsec3Params {
                algorithm: spec.algorithm.unwrap_or(0),
                iterations: spec.iterations.unwrap_or(0),
                salt: spec.salt,
                opt_out: spec.opt_out.unwrap_or(false),
            })),
            _ => None,
        });

        SignConf {
            resign: self.signatures.resign,
            refresh: self.signatures.refresh,
            validity_default: self.signatures.validity_default,
            validity_denial: self.signatures.validity_denial,
            jitter: self.signatures.jitter,
            inception_offset: self.signatures.inception_offset,
            denial,
            dnskey_ttl: self.keys.ttl,
            keys: self
                .keys
                .keys
                .into_iter()
                .map(|k| Key {
                    locator: k.locator,
                    algorithm: k.algorithm,
                    flags: k.flags,
                    publish: k.publish,
                    ksk: k.ksk,
                    zsk: k.zsk,
                })
                .collect(),
            soa_ttl: self.soa.ttl,
            soa_min: self.soa.minimum,
            soa_serial: self.soa.serial,
            audit: self.audit,
            last_modified: UnixTime::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPLETE: &str = r#"
        audit = true

        [signatures]
        resign = "PT2H"
        refresh = "P3D"
        validity-default = "P14D"
        validity-denial = "P14D"
        jitter = "PT12H"
        inception-offset = "PT1H"

        [denial]
        type = "nsec3"
        algorithm = 1
        iterations = 5
        salt = "beef"
        opt-out = false

        [keys]
        ttl = "PT1H"

        [[keys.key]]
        locator = "8a2d..e1"
        algorithm = 8
        flags = 257
        publish = true
        ksk = true
        zsk = false

        [soa]
        ttl = "PT1H"
        minimum = "PT1H"
        serial = "unixtime"
    "#;

    fn complete() -> SignConf {
        toml::from_str::<Spec>(COMPLETE).unwrap().parse()
    }

    #[test]
    fn complete_signconf_checks_out() {
        let sc = complete();
        assert_eq!(sc.check(), Ok(()));
        assert_eq!(sc.resign, Some(TimeSpan::from_secs(7200)));
        assert!(sc.audit);
        assert_eq!(sc.keys.len(), 1);
        assert!(matches!(sc.denial, Some(Denial::Nsec3(_))));
    }

    #[test]
    fn check_reports_all_problems() {
        let sc = SignConf::default();
        let errors = sc.check().unwrap_err();
        assert!(errors.contains(&SignConfError::MissingResignInterval));
        assert!(errors.contains(&SignConfError::MissingDenial));
        assert!(errors.contains(&SignConfError::NoKeys));
        assert!(errors.contains(&SignConfError::MissingSerialPolicy));
    }

    #[test]
    fn check_rejects_bad_serial_policy() {
        let mut sc = complete();
        sc.soa_serial = Some("sequential".into());
        let errors = sc.check().unwrap_err();
        assert_eq!(
            errors,
            vec![SignConfError::BadSerialPolicy("sequential".into())]
        );
    }

    #[test]
    fn check_rejects_nsec3_without_algorithm() {
        let mut sc = complete();
        sc.denial = Some(Denial::Nsec3(Nsec3Params::default()));
        let errors = sc.check().unwrap_err();
        assert_eq!(errors, vec![SignConfError::MissingNsec3Algorithm]);
    }

    #[test]
    fn timer_change_requires_resign_only() {
        let old = complete();
        let mut new = complete();
        new.resign = Some(TimeSpan::from_secs(3600));
        assert_eq!(old.compare(&new), Stage::Sign);
    }

    #[test]
    fn nsec3_salt_change_requires_full_read() {
        let old = complete();
        let mut new = complete();
        new.denial = Some(Denial::Nsec3(Nsec3Params {
            algorithm: 1,
            iterations: 5,
            salt: Some("f00d".into()),
            opt_out: false,
        }));
        assert_eq!(old.compare(&new), Stage::Read);
    }

    #[test]
    fn denial_type_change_requires_full_read() {
        let old = complete();
        let mut new = complete();
        new.denial = Some(Denial::Nsec);
        assert_eq!(old.compare(&new), Stage::Read);
    }

    #[test]
    fn key_list_change_requires_full_read() {
        let old = complete();
        let mut new = complete();
        new.keys.push(Key {
            locator: "77aa..90".into(),
            algorithm: 8,
            flags: 256,
            publish: true,
            ksk: false,
            zsk: true,
        });
        assert_eq!(old.compare(&new), Stage::Read);
    }

    #[test]
    fn soa_minimum_change_requires_full_read() {
        let old = complete();
        let mut new = complete();
        new.soa_min = Some(TimeSpan::from_secs(300));
        assert_eq!(old.compare(&new), Stage::Read);
    }

    #[test]
    fn unchanged_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::try_from(dir.path().join("example.com.toml")).unwrap();
        std::fs::write(&path, COMPLETE).unwrap();

        let sc = read(&path, UnixTime::default()).unwrap().unwrap();
        assert!(sc.last_modified > UnixTime::default());

        // A second read against the recorded mtime reports "unchanged".
        assert!(read(&path, sc.last_modified).unwrap().is_none());
    }
}
