// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

//! In-memory storage engine for executor tests. Records every call, enforces
//! the undo-token contract from the trait docs, and lets tests script what
//! individual plan fragments return.

use crate::{
    DependencySet, EngineError, StatsSelector, StorageEngine, TableStats, WorkUnit,
};
use bytes::Bytes;
use kiln_infallible::Mutex;
use kiln_types::{
    is_real_undo_token, FragmentId, TxnId, UndoToken, DISABLE_UNDO_TOKEN,
};
use std::{collections::{BTreeSet, HashMap}, sync::Arc};

/// What a scripted fragment does when executed.
#[derive(Clone, Debug)]
pub enum FragmentBehavior {
    /// Return these rowsets, one per output dependency.
    Rows(Vec<Bytes>),
    Error(EngineError),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecordedExecution {
    pub txn_id: TxnId,
    pub fragment_ids: Vec<FragmentId>,
    pub undo_token: UndoToken,
    pub last_committed_txn: TxnId,
}

/// Every externally visible engine effect, in call order. Tests assert on
/// this to pin down commit/rollback interleavings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EngineCall {
    Execute(RecordedExecution),
    Release(UndoToken),
    Undo(UndoToken),
    Tick { last_committed_txn: TxnId },
    LoadTable { table: String },
    StashDependencies { dep_ids: Vec<u32> },
}

#[derive(Debug, Default)]
struct MockEngineState {
    behaviors: HashMap<FragmentId, FragmentBehavior>,
    calls: Vec<EngineCall>,
    outstanding: BTreeSet<UndoToken>,
    last_released: Option<UndoToken>,
}

/// Handle for inspecting a [`MockEngine`] after it has been moved into an
/// executor.
#[derive(Clone, Debug, Default)]
pub struct MockEngineHandle {
    state: Arc<Mutex<MockEngineState>>,
}

impl MockEngineHandle {
    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().calls.clone()
    }

    pub fn released_tokens(&self) -> Vec<UndoToken> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                EngineCall::Release(t) => Some(*t),
                _ => None,
            })
            .collect()
    }

    pub fn undone_tokens(&self) -> Vec<UndoToken> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                EngineCall::Undo(t) => Some(*t),
                _ => None,
            })
            .collect()
    }

    pub fn executions(&self) -> Vec<RecordedExecution> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                EngineCall::Execute(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn outstanding_tokens(&self) -> Vec<UndoToken> {
        self.state.lock().outstanding.iter().copied().collect()
    }
}

#[derive(Debug, Default)]
pub struct MockEngine {
    state: Arc<Mutex<MockEngineState>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(self, fragment_id: FragmentId, behavior: FragmentBehavior) -> Self {
        self.state.lock().behaviors.insert(fragment_id, behavior);
        self
    }

    pub fn handle(&self) -> MockEngineHandle {
        MockEngineHandle {
            state: self.state.clone(),
        }
    }
}

impl StorageEngine for MockEngine {
    fn load_catalog(&mut self, _catalog: &[u8]) -> Result<(), EngineError> {
        Ok(())
    }

    fn tick(&mut self, _ts_ms: u64, last_committed_txn: TxnId) {
        self.state
            .lock()
            .calls
            .push(EngineCall::Tick { last_committed_txn });
    }

    fn execute_plan_fragments(&mut self, work: &WorkUnit) -> Result<DependencySet, EngineError> {
        let mut state = self.state.lock();
        if is_real_undo_token(work.undo_token) {
            if let Some(last) = state.last_released {
                assert!(
                    work.undo_token > last,
                    "execution under token {} at or below last committed {}",
                    work.undo_token,
                    last,
                );
            }
            state.outstanding.insert(work.undo_token);
        }
        state.calls.push(EngineCall::Execute(RecordedExecution {
            txn_id: work.txn_id,
            fragment_ids: work.fragment_ids.clone(),
            undo_token: work.undo_token,
            last_committed_txn: work.last_committed_txn,
        }));

        let mut deps = DependencySet::new();
        let mut output_ids = work.output_dep_ids.iter();
        for fragment_id in &work.fragment_ids {
            let data = match state.behaviors.get(fragment_id) {
                Some(FragmentBehavior::Rows(rows)) => rows.clone(),
                Some(FragmentBehavior::Error(e)) => return Err(e.clone()),
                // Unscripted fragments echo their id, one rowset per fragment.
                None => vec![Bytes::from(fragment_id.to_le_bytes().to_vec())],
            };
            for rowset in data {
                if let Some(dep_id) = output_ids.next() {
                    deps.insert(*dep_id, rowset);
                }
            }
        }
        Ok(deps)
    }

    fn release_undo_token(&mut self, token: UndoToken) {
        assert_ne!(token, DISABLE_UNDO_TOKEN, "cannot release the no-logging sentinel");
        let mut state = self.state.lock();
        if let Some(last) = state.last_released {
            assert!(
                token > last,
                "release tokens must strictly increase: {} after {}",
                token,
                last,
            );
        }
        // Commits token and everything outstanding below it.
        state.outstanding.retain(|t| *t > token);
        state.last_released = Some(token);
        state.calls.push(EngineCall::Release(token));
    }

    fn undo_undo_token(&mut self, token: UndoToken) {
        let mut state = self.state.lock();
        if let Some(last) = state.last_released {
            assert!(
                token > last,
                "undo of already-committed token {} (last committed {})",
                token,
                last,
            );
        }
        // Rolls back token and everything outstanding above it.
        state.outstanding.retain(|t| *t < token);
        state.calls.push(EngineCall::Undo(token));
    }

    fn get_stats(
        &mut self,
        _selector: StatsSelector,
        table_ids: &[u32],
        _ts_ms: u64,
    ) -> Result<Vec<TableStats>, EngineError> {
        Ok(table_ids
            .iter()
            .map(|id| TableStats {
                table_id: *id,
                ..TableStats::default()
            })
            .collect())
    }

    fn load_table(
        &mut self,
        table: &str,
        _rows: Bytes,
        _txn_id: TxnId,
        _last_committed_txn: TxnId,
        _undo_token: UndoToken,
        _allow_export: bool,
    ) -> Result<(), EngineError> {
        self.state.lock().calls.push(EngineCall::LoadTable {
            table: table.to_string(),
        });
        Ok(())
    }

    fn stash_work_unit_dependencies(&mut self, deps: DependencySet) {
        self.state.lock().calls.push(EngineCall::StashDependencies {
            dep_ids: deps.keys().copied().collect(),
        });
    }
}
