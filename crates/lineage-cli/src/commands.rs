//! Subcommands and their execution against an [`AggregateRepository`].
//!
//! Every command prints one JSON document on stdout. Mutating commands read
//! the aggregate for update, apply one change and save it, so a concurrent
//! writer surfaces as a lock conflict rather than a lost update.

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use lineage_core::{
  Aggregate, AggregateRepository, Error, FindOptions,
  capability::{Clock, ReadCache},
  entity::NewEntity,
  selection::{EntityRef, SelectionItem},
  store::{EntityQuery, EntityStore},
  version::{Status, Version},
};
use serde_json::{Value, json};
use uuid::Uuid;

// ─── Arguments ───────────────────────────────────────────────────────────────

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Create a new entity as Draft 0.1.
  Create {
    kind:    String,
    name:    String,
    /// JSON payload document.
    #[arg(long, value_parser = parse_json, default_value = "{}")]
    payload: Value,
  },

  /// Show one version of an entity with its selection lists.
  Show {
    uid:     Uuid,
    #[arg(long)]
    version: Option<Version>,
    #[arg(long)]
    status:  Option<Status>,
    /// RFC 3339 timestamp; shows the version valid at that instant.
    #[arg(long)]
    at:      Option<DateTime<Utc>>,
  },

  /// Every stored version of an entity, oldest first.
  History { uid: Uuid },

  /// Current versions matching the filters.
  List {
    #[arg(long)]
    kind:            Option<String>,
    #[arg(long)]
    status:          Option<Status>,
    /// Case-insensitive substring of the name.
    #[arg(long)]
    name:            Option<String>,
    #[arg(long)]
    include_deleted: bool,
    #[arg(long)]
    limit:           Option<usize>,
    #[arg(long)]
    offset:          Option<usize>,
  },

  /// Edit the payload (and optionally the name) of a Draft.
  Edit {
    uid:     Uuid,
    #[arg(long, value_parser = parse_json)]
    payload: Option<Value>,
    #[arg(long)]
    name:    Option<String>,
    #[arg(short, long)]
    message: String,
  },

  /// Approve a Draft, producing the next major version.
  Approve { uid: Uuid },

  /// Open a new Draft on top of a Final version.
  NewVersion {
    uid:     Uuid,
    #[arg(short, long)]
    message: String,
  },

  /// Retire a Final version.
  Inactivate { uid: Uuid },

  /// Bring a Retired version back to Final.
  Reactivate { uid: Uuid },

  /// Soft-delete an entity that was never approved.
  Delete { uid: Uuid },

  /// Lock the selection lists of an entity.
  Freeze { uid: Uuid },

  Unfreeze { uid: Uuid },

  /// Work with the ordered selection lists of an entity.
  #[command(subcommand)]
  Select(SelectCommand),

  /// Every action record under an entity, in commit order.
  Audit { parent: Uuid },
}

#[derive(Subcommand, Debug)]
pub enum SelectCommand {
  /// Append an item to a selection list.
  Add {
    parent:     Uuid,
    kind:       String,
    #[arg(long, value_parser = parse_json, default_value = "{}")]
    payload:    Value,
    /// Related entity as `UID` or `UID@MAJOR.MINOR`; repeatable.
    #[arg(long = "ref")]
    references: Vec<EntityRef>,
  },

  Remove {
    parent:        Uuid,
    kind:          String,
    selection_uid: Uuid,
  },

  /// Move an item to a 1-based position; out-of-range values are clamped.
  Move {
    parent:        Uuid,
    kind:          String,
    selection_uid: Uuid,
    order:         i64,
  },

  /// Replace the payload and references of an item in place.
  Edit {
    parent:        Uuid,
    kind:          String,
    selection_uid: Uuid,
    #[arg(long, value_parser = parse_json)]
    payload:       Value,
    #[arg(long = "ref")]
    references:    Vec<EntityRef>,
  },

  /// The current items of one list, or of every list.
  List { parent: Uuid, kind: Option<String> },

  /// One entry per recorded change of an item.
  History { parent: Uuid, selection_uid: Uuid },

  /// Pinned references whose target has a newer accepted version.
  Outdated { parent: Uuid, kind: String },

  /// Re-pin a reference, to `--version` or else the newest accepted one.
  Repin {
    parent:        Uuid,
    kind:          String,
    selection_uid: Uuid,
    target:        Uuid,
    #[arg(long)]
    version:       Option<Version>,
  },

  /// Keep a reference's pin and stop reporting the newest version as newer.
  Accept {
    parent:        Uuid,
    kind:          String,
    selection_uid: Uuid,
    target:        Uuid,
  },
}

fn parse_json(s: &str) -> Result<Value, String> {
  serde_json::from_str(s).map_err(|e| format!("invalid JSON: {e}"))
}

// ─── Execution ───────────────────────────────────────────────────────────────

/// Runs one command and returns the document to print.
pub fn run<S, C, K>(
  repo: &AggregateRepository<S, C, K>,
  author: &str,
  command: Command,
) -> Result<Value>
where
  S: EntityStore,
  C: ReadCache,
  K: Clock,
{
  match command {
    Command::Create {
      kind,
      name,
      payload,
    } => {
      let mut agg = Aggregate::create(NewEntity::new(kind, name, payload), author)?;
      repo.save(&mut agg, author).context("failed to save new entity")?;
      tracing::info!(uid = %agg.uid(), "created");
      Ok(view(&agg))
    }

    Command::Show {
      uid,
      version,
      status,
      at,
    } => {
      let mut options = FindOptions::current();
      if let Some(version) = version {
        options = options.version(version);
      }
      if let Some(status) = status {
        options = options.status(status);
      }
      if let Some(at) = at {
        options = options.at(at);
      }
      Ok(view(&repo.find_by_uid(uid, options)?))
    }

    Command::History { uid } => Ok(serde_json::to_value(repo.history(uid)?)?),

    Command::List {
      kind,
      status,
      name,
      include_deleted,
      limit,
      offset,
    } => {
      let query = EntityQuery {
        kind,
        status,
        name_contains: name,
        include_deleted,
        limit,
        offset,
      };
      Ok(serde_json::to_value(repo.find_all(&query)?)?)
    }

    Command::Edit {
      uid,
      payload,
      name,
      message,
    } => mutate(repo, uid, author, |agg| {
      let payload = payload.unwrap_or_else(|| agg.entity().payload.clone());
      let changed = match name {
        Some(name) => agg.rename_draft(name, payload, author, &message)?,
        None => agg.edit_draft(payload, author, &message)?,
      };
      if !changed {
        tracing::info!(%uid, "draft unchanged");
      }
      Ok(())
    }),

    Command::Approve { uid } => mutate(repo, uid, author, |agg| agg.approve(author)),
    Command::NewVersion { uid, message } => {
      mutate(repo, uid, author, |agg| agg.create_new_version(author, &message))
    }
    Command::Inactivate { uid } => mutate(repo, uid, author, |agg| agg.inactivate(author)),
    Command::Reactivate { uid } => mutate(repo, uid, author, |agg| agg.reactivate(author)),
    Command::Freeze { uid } => mutate(repo, uid, author, Aggregate::freeze),
    Command::Unfreeze { uid } => mutate(repo, uid, author, Aggregate::unfreeze),

    Command::Delete { uid } => {
      let mut agg = repo.find_by_uid(uid, FindOptions::for_update())?;
      agg.soft_delete()?;
      repo.save(&mut agg, author)?;
      tracing::info!(%uid, "deleted");
      Ok(json!({ "uid": uid, "deleted": true }))
    }

    Command::Select(command) => run_select(repo, author, command),

    Command::Audit { parent } => Ok(serde_json::to_value(repo.audit_trail(parent)?)?),
  }
}

fn run_select<S, C, K>(
  repo: &AggregateRepository<S, C, K>,
  author: &str,
  command: SelectCommand,
) -> Result<Value>
where
  S: EntityStore,
  C: ReadCache,
  K: Clock,
{
  match command {
    SelectCommand::Add {
      parent,
      kind,
      payload,
      references,
    } => {
      let mut added = None;
      let mut doc = mutate(repo, parent, author, |agg| {
        let item = agg
          .selection_mut(&kind)
          .add(SelectionItem::new(payload, references))?;
        added = Some(item.selection_uid);
        Ok(())
      })?;
      doc["added"] = json!(added);
      Ok(doc)
    }

    SelectCommand::Remove {
      parent,
      kind,
      selection_uid,
    } => mutate(repo, parent, author, |agg| {
      agg.selection_mut(&kind).remove(selection_uid).map(drop)
    }),

    SelectCommand::Move {
      parent,
      kind,
      selection_uid,
      order,
    } => mutate(repo, parent, author, |agg| {
      agg.selection_mut(&kind).set_new_order(selection_uid, order)
    }),

    SelectCommand::Edit {
      parent,
      kind,
      selection_uid,
      payload,
      references,
    } => mutate(repo, parent, author, |agg| {
      agg
        .selection_mut(&kind)
        .update(selection_uid, payload, references)
    }),

    SelectCommand::List { parent, kind } => {
      let agg = repo.find_by_uid(parent, FindOptions::current())?;
      let lists = selections(&agg);
      Ok(match kind {
        Some(kind) => lists.get(&kind).cloned().unwrap_or_else(|| json!([])),
        None => lists,
      })
    }

    SelectCommand::History {
      parent,
      selection_uid,
    } => Ok(serde_json::to_value(
      repo.selection_history(parent, selection_uid)?,
    )?),

    SelectCommand::Outdated { parent, kind } => {
      let agg = repo.find_by_uid(parent, FindOptions::current())?;
      Ok(serde_json::to_value(repo.outdated_references(&agg, &kind)?)?)
    }

    SelectCommand::Repin {
      parent,
      kind,
      selection_uid,
      target,
      version,
    } => mutate(repo, parent, author, |agg| {
      let version = match version {
        Some(version) => version,
        None => newest_version(repo, agg, &kind, selection_uid, target)?,
      };
      agg
        .selection_mut(&kind)
        .update_reference_version(selection_uid, target, version)
    }),

    SelectCommand::Accept {
      parent,
      kind,
      selection_uid,
      target,
    } => mutate(repo, parent, author, |agg| {
      let version = newest_version(repo, agg, &kind, selection_uid, target)?;
      agg
        .selection_mut(&kind)
        .accept_reference_version(selection_uid, target, version)
    }),
  }
}

/// The version an outdated reference could move to.
fn newest_version<S, C, K>(
  repo: &AggregateRepository<S, C, K>,
  agg: &Aggregate,
  kind: &str,
  selection_uid: Uuid,
  target: Uuid,
) -> lineage_core::Result<Version>
where
  S: EntityStore,
  C: ReadCache,
  K: Clock,
{
  repo
    .outdated_references(agg, kind)?
    .into_iter()
    .find(|o| o.selection_uid == selection_uid && o.reference.uid == target)
    .map(|o| o.latest)
    .ok_or_else(|| Error::validation("reference", format!("{target} is already up to date")))
}

/// Read `uid` for update, apply `change`, save, and show the result.
fn mutate<S, C, K>(
  repo: &AggregateRepository<S, C, K>,
  uid: Uuid,
  author: &str,
  change: impl FnOnce(&mut Aggregate) -> lineage_core::Result<()>,
) -> Result<Value>
where
  S: EntityStore,
  C: ReadCache,
  K: Clock,
{
  let mut agg = repo.find_by_uid(uid, FindOptions::for_update())?;
  change(&mut agg)?;
  let token = repo.save(&mut agg, author)?;
  tracing::debug!(%uid, token = token.as_str(), "saved");
  Ok(view(&agg))
}

// ─── Rendering ───────────────────────────────────────────────────────────────

fn view(agg: &Aggregate) -> Value {
  json!({
    "entity":     agg.entity(),
    "frozen":     agg.is_frozen(),
    "lock_token": agg.lock_token().map(|t| t.as_str()),
    "selections": selections(agg),
  })
}

fn selections(agg: &Aggregate) -> Value {
  agg
    .selections()
    .map(|list| (list.kind().to_owned(), json!(list.items())))
    .collect::<serde_json::Map<_, _>>()
    .into()
}
