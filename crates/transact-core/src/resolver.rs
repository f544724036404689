//! Identity assignment for a batch being saved.
//!
//! Events are processed in call order. The first event rooted at the
//! transaction allocates the transaction identity, which is stamped on every
//! record. Objects that already have an identity become the `root` of their
//! events; objects seen for the first time get a fresh identity that serves
//! both as their permanent identity and as the `root` and `identity` of their
//! creation record.

use std::collections::HashMap;

use transact_store::IdentityGenerator;
use transact_types::{EventRecord, Identity, Params, Value};

use crate::args::{Arg, ObjectKey};
use crate::context::PendingEvent;
use crate::error::{CoreError, CoreResult};

pub(crate) struct StampedBatch {
    pub(crate) records: Vec<EventRecord>,
    /// Identities allocated for objects that had none before this batch.
    pub(crate) assigned: HashMap<ObjectKey, Identity>,
}

pub(crate) fn stamp(
    root: ObjectKey,
    events: &[PendingEvent],
    mut known: HashMap<ObjectKey, Identity>,
    generator: &dyn IdentityGenerator,
) -> CoreResult<StampedBatch> {
    let mut transaction = known.get(&root).cloned();
    let mut assigned = HashMap::new();
    let mut records = Vec::with_capacity(events.len());

    for event in events {
        let (identity, event_root) = if event.root == root {
            match &transaction {
                Some(txn) => (generator.next_identity(), txn.clone()),
                None => {
                    let txn = generator.next_identity();
                    transaction = Some(txn.clone());
                    known.insert(root, txn.clone());
                    assigned.insert(root, txn.clone());
                    (txn.clone(), txn)
                }
            }
        } else if let Some(existing) = known.get(&event.root) {
            (generator.next_identity(), existing.clone())
        } else {
            let fresh = generator.next_identity();
            known.insert(event.root, fresh.clone());
            assigned.insert(event.root, fresh.clone());
            (fresh.clone(), fresh)
        };

        let transaction = transaction.clone().ok_or_else(|| {
            CoreError::InvalidState("batch does not open with its transaction event".into())
        })?;
        records.push(EventRecord {
            transaction,
            identity,
            root: event_root,
            event_name: event.event_name.clone(),
            params: convert_params(event, &known)?,
        });
    }

    Ok(StampedBatch { records, assigned })
}

/// Rewrite object arguments into the identities of the objects they name.
fn convert_params(event: &PendingEvent, known: &HashMap<ObjectKey, Identity>) -> CoreResult<Params> {
    event
        .args
        .iter()
        .map(|(name, arg)| {
            let value = match arg {
                Arg::Value(v) => v.clone(),
                Arg::Stored { identity, .. } => Value::Ref(identity.clone()),
                Arg::Object { key, .. } => known
                    .get(key)
                    .cloned()
                    .map(Value::Ref)
                    .ok_or_else(|| CoreError::UnsupportedParameterType {
                        event: event.event_name.clone(),
                        param: name.clone(),
                    })?,
            };
            Ok((name.clone(), value))
        })
        .collect()
}
