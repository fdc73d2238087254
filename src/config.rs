use std::{fs, io};

use anyhow::{Context, Result, anyhow};
use camino::Utf8PathBuf;
use serde::Deserialize;
use sha2::{Digest, Sha256};

#[inline]
fn default_cache_dir() -> Utf8PathBuf {
    let mut p = home::home_dir()
        .and_then(|h| Utf8PathBuf::try_from(h).ok())
        .unwrap_or_else(|| Utf8PathBuf::from("."));
    p.extend([".cache", "outlet"]);
    p
}

#[inline]
fn default_sig_batch_size() -> usize {
    64
}

#[inline]
fn default_max_result_count() -> usize {
    100_000
}

#[derive(Debug, Deserialize)]
pub struct Configuration {
    /// Root directory under which per-device on-disk index files and the
    /// cache registry live.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: Utf8PathBuf,

    /// Number of file nodes the signature-calc worker batches per sqlite
    /// transaction before yielding.
    #[serde(default = "default_sig_batch_size")]
    pub sig_batch_size: usize,

    /// Ceiling on rows a single `TreeStore`/`CacheManager` query is allowed
    /// to return before it fails with `EngineError::ResultsExceeded`.
    #[serde(default = "default_max_result_count")]
    pub max_result_count: usize,

    /// This machine's stable device identity, persisted the first time the
    /// engine runs so restarts reuse the same device row instead of
    /// registering a new one. `None` until `ensure_device_long_id` populates it.
    #[serde(default)]
    pub device_long_id: Option<String>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            sig_batch_size: default_sig_batch_size(),
            max_result_count: default_max_result_count(),
            device_long_id: None,
        }
    }
}

fn config_path() -> Result<Utf8PathBuf> {
    let mut confpath: Utf8PathBuf = home::home_dir()
        .ok_or_else(|| anyhow!("Can't find home directory"))?
        .try_into()
        .context("Home directory isn't UTF-8")?;
    confpath.extend([".config", "outlet.toml"]);
    Ok(confpath)
}

pub fn load() -> Result<Configuration> {
    let confpath = config_path()?;
    let s = match fs::read_to_string(&confpath) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Configuration::default()),
        found => found,
    }
    .with_context(|| format!("Couldn't open {confpath}"))?;
    let conf = toml::from_str(&s).with_context(|| format!("Couldn't parse {confpath}"))?;
    Ok(conf)
}

/// Path to the single-line device-id file under `cache_dir` (spec.md §6:
/// "A device UUID file ... created on first run to identify this local
/// device across restarts").
fn device_id_path(conf: &Configuration) -> Utf8PathBuf {
    conf.cache_dir.join("device_id")
}

/// Returns this machine's persisted device long-id, reading it back from
/// `device_id_path` if a prior run already wrote one, or generating and
/// persisting a fresh one otherwise. Unlike a value only held in-memory
/// `Configuration`, this file is what makes the id survive a restart
/// regardless of whether `outlet.toml` itself exists or round-trips.
pub fn ensure_device_long_id(conf: &mut Configuration) -> Result<String> {
    let path = device_id_path(conf);
    if let Ok(existing) = fs::read_to_string(&path) {
        let id = existing.trim().to_string();
        if !id.is_empty() {
            conf.device_long_id = Some(id.clone());
            return Ok(id);
        }
    }

    let host = hostname::get()
        .context("Couldn't determine hostname")?
        .to_string_lossy()
        .into_owned();
    // No randomness source in this crate's dependency stack; a sha256 of
    // host + wall-clock nanos + pid is unique enough to tell devices apart
    // without fabricating a `rand`/`uuid` dependency the teacher never had.
    let nanos = jiff::Timestamp::now().as_nanosecond();
    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    let digest = hasher.finalize();
    let id = format!("{host}-{}", data_encoding::BASE32HEX_NOPAD.encode(&digest[..10]));

    fs::create_dir_all(&conf.cache_dir)
        .with_context(|| format!("Couldn't create cache dir {}", conf.cache_dir))?;
    fs::write(&path, format!("{id}\n")).with_context(|| format!("Couldn't write {path}"))?;
    conf.device_long_id = Some(id.clone());
    Ok(id)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_configuration_has_sane_batch_size() {
        let conf = Configuration::default();
        assert!(conf.sig_batch_size > 0);
    }
}
