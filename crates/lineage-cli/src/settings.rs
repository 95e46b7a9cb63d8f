//! Layered settings: an optional TOML file, then `LINEAGE_*` variables.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use lineage_core::config::RepositoryConfig;
use serde::Deserialize;

/// Everything the binary needs besides the subcommand itself.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
  #[serde(default = "default_store_path")]
  pub store_path: PathBuf,
  /// Recorded as the author of every change made through the CLI.
  #[serde(default = "default_author")]
  pub author:     String,
  #[serde(default)]
  pub repository: RepositoryConfig,
}

fn default_store_path() -> PathBuf { PathBuf::from("lineage.db") }

fn default_author() -> String {
  std::env::var("USER").unwrap_or_else(|_| "lineage".to_string())
}

impl Settings {
  /// Read `path` if given (it must exist), otherwise `lineage.toml` in the
  /// working directory if present. Environment variables override both,
  /// e.g. `LINEAGE_STORE_PATH` or `LINEAGE_REPOSITORY__GUARD_ORDER`.
  pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
    let file = match path {
      Some(path) => config::File::from(path.to_path_buf()).required(true),
      None => config::File::with_name("lineage").required(false),
    };
    let mut settings: Self = config::Config::builder()
      .add_source(file)
      .add_source(
        config::Environment::with_prefix("LINEAGE")
          .prefix_separator("_")
          .separator("__"),
      )
      .build()
      .context("failed to read config")?
      .try_deserialize()
      .context("failed to deserialise settings")?;

    settings.store_path = expand_tilde(&settings.store_path);
    Ok(settings)
  }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}

#[cfg(test)]
mod tests {
  use lineage_core::config::{GuardOrder, ReorderPolicy};
  use lineage_core::version::Status;

  use super::*;

  #[test]
  fn file_values_fill_settings() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lineage.toml");
    std::fs::write(
      &path,
      r#"
store_path = "/var/lib/lineage/studies.db"
author = "curator"

[repository]
guard_order = "lock_first"

[repository.selections.arms]
reorder = "audited"
accepted_statuses = ["final", "draft"]
"#,
    )
    .unwrap();

    let settings = Settings::load(Some(&path)).unwrap();
    assert_eq!(settings.store_path, PathBuf::from("/var/lib/lineage/studies.db"));
    assert_eq!(settings.author, "curator");
    assert_eq!(settings.repository.guard_order, GuardOrder::LockFirst);

    let arms = settings.repository.policy_for("arms");
    assert_eq!(arms.reorder, ReorderPolicy::Audited);
    assert_eq!(arms.accepted_statuses, [Status::Final, Status::Draft]);
    assert_eq!(
      settings.repository.policy_for("units").reorder,
      ReorderPolicy::Silent
    );
  }

  #[test]
  fn missing_explicit_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Settings::load(Some(&dir.path().join("absent.toml"))).is_err());
  }

  #[test]
  fn tilde_expands_only_at_the_start() {
    let Ok(home) = std::env::var("HOME") else { return };
    assert_eq!(
      expand_tilde(Path::new("~/data/lineage.db")),
      PathBuf::from(home).join("data/lineage.db")
    );
    assert_eq!(expand_tilde(Path::new("/srv/~/x.db")), PathBuf::from("/srv/~/x.db"));
  }
}
