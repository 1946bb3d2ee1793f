//! A fake kernel for exercising attach logic without loading anything.

use std::{
    collections::{BTreeSet, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    probe::{AttachKind, ProbeAttacher},
    program::ProgramError,
    symbols::SymbolResolver,
};

/// Operation observed by [`FakeKernel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeOp {
    Attach {
        program: String,
        kind: AttachKind,
        symbol: String,
    },
    Detach {
        program: String,
        symbol: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FakeLink(u64);

#[derive(Default)]
struct State {
    symbols: BTreeSet<String>,
    refuse_attach: HashSet<String>,
    refuse_detach: HashSet<String>,
    next_link: u64,
    live: Vec<(FakeLink, String, String)>,
    journal: Vec<FakeOp>,
}

/// Resolves a fixed set of symbols and records every attach and detach.
///
/// Clones share the same state, so a test can keep a handle while the
/// manager owns another.
#[derive(Clone, Default)]
pub struct FakeKernel {
    state: Arc<Mutex<State>>,
}

impl FakeKernel {
    pub fn with_symbols<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let kernel = Self::default();
        kernel.state().symbols = symbols.into_iter().map(Into::into).collect();
        kernel
    }

    /// Attaching to `symbol` will fail even though it resolves.
    pub fn refuse_attach(&self, symbol: &str) {
        self.state().refuse_attach.insert(symbol.to_string());
    }

    /// Detaching from `symbol` will fail.
    pub fn refuse_detach(&self, symbol: &str) {
        self.state().refuse_detach.insert(symbol.to_string());
    }

    /// Symbols with a probe currently attached, in attach order.
    pub fn live_symbols(&self) -> Vec<String> {
        self.state()
            .live
            .iter()
            .map(|(_, _, symbol)| symbol.clone())
            .collect()
    }

    pub fn journal(&self) -> Vec<FakeOp> {
        self.state().journal.clone()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SymbolResolver for FakeKernel {
    fn resolve(&self, name: &str) -> Option<u64> {
        let state = self.state();
        state
            .symbols
            .iter()
            .position(|symbol| symbol == name)
            .map(|position| 0xffff_ffff_8100_0000 + 0x100 * position as u64)
    }
}

impl ProbeAttacher for FakeKernel {
    type Link = FakeLink;

    fn attach(
        &mut self,
        program: &str,
        kind: AttachKind,
        symbol: &str,
    ) -> Result<FakeLink, ProgramError> {
        let mut state = self.state();
        state.journal.push(FakeOp::Attach {
            program: program.to_string(),
            kind,
            symbol: symbol.to_string(),
        });
        if state.refuse_attach.contains(symbol) || !state.symbols.contains(symbol) {
            return Err(ProgramError::ProgramAttachError {
                program: program.to_string(),
                symbol: symbol.to_string(),
                source: "attach refused by fake kernel".into(),
            });
        }
        state.next_link += 1;
        let link = FakeLink(state.next_link);
        state
            .live
            .push((link, program.to_string(), symbol.to_string()));
        Ok(link)
    }

    fn detach(&mut self, link: FakeLink) -> Result<(), ProgramError> {
        let mut state = self.state();
        let position = state
            .live
            .iter()
            .position(|(live, _, _)| *live == link)
            .ok_or_else(|| ProgramError::ProgramDetachError {
                program: format!("{link:?}"),
                source: "unknown link".into(),
            })?;
        let (_, program, symbol) = state.live[position].clone();
        state.journal.push(FakeOp::Detach {
            program: program.clone(),
            symbol: symbol.clone(),
        });
        if state.refuse_detach.contains(&symbol) {
            return Err(ProgramError::ProgramDetachError {
                program,
                source: "detach refused by fake kernel".into(),
            });
        }
        state.live.remove(position);
        Ok(())
    }
}
