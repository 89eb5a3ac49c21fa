//! Fuzz target for the generate state machine.
//!
//! Drives a small session with arbitrary sequences of context operations and
//! checks after every step that slots are never shared, fills stay within the
//! context length, and the driver holds exactly what the pool mirrors.

#![no_main]

use std::sync::Arc;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use mux_core::{Context, ContextKind, MockDriver, Session, SessionConfig};

const MAX_CONTEXT_LENGTH: u32 = 16;
const MAX_CONTEXTS: usize = 4;

#[derive(Debug, Arbitrary)]
enum Kind {
    Direct,
    MinUpload,
    MinDiscard,
}

impl From<Kind> for ContextKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Direct => ContextKind::Direct,
            Kind::MinUpload => ContextKind::MinUpload,
            Kind::MinDiscard => ContextKind::MinDiscard,
        }
    }
}

#[derive(Debug, Arbitrary)]
enum Op {
    Create(Kind),
    Destroy(u8),
    Begin(u8),
    Generate { ctx: u8, offset: u8, tokens: Vec<u8> },
    End(u8),
}

#[derive(Debug, Arbitrary)]
struct Input {
    cap: u8,
    preallocate: u8,
    ops: Vec<Op>,
}

fn pick<'a, 's>(contexts: &'a mut [Context<'s>], i: u8) -> Option<&'a mut Context<'s>> {
    if contexts.is_empty() {
        return None;
    }
    let len = contexts.len();
    contexts.get_mut(i as usize % len)
}

fn check(session: &Session, driver: &MockDriver) {
    let slots = session.slots();
    let mut owners: Vec<_> = slots.iter().filter_map(|s| s.owner).collect();
    owners.sort_by_key(|id| id.as_u64());
    owners.dedup();
    assert_eq!(owners.len(), slots.iter().filter(|s| s.owner.is_some()).count());

    for slot in &slots {
        assert!(slot.filled_size <= MAX_CONTEXT_LENGTH);
        let held = driver.slot_tokens(slot.descriptor).unwrap_or_default();
        assert!(held.starts_with(&slot.tokens));
    }
}

fuzz_target!(|input: Input| {
    let driver = Arc::new(MockDriver::with_context_length(MAX_CONTEXT_LENGTH));
    let config = SessionConfig {
        max_physical_contexts: (input.cap % 5) as usize,
        preallocate: (input.preallocate % 3) as usize,
    };
    let Ok(session) = Session::with_config(driver.clone(), config) else {
        return;
    };
    let mut contexts: Vec<Context<'_>> = Vec::new();

    for op in input.ops {
        match op {
            Op::Create(kind) => {
                if contexts.len() < MAX_CONTEXTS {
                    if let Ok(ctx) = session.create_context(kind.into()) {
                        contexts.push(ctx);
                    }
                }
            }
            Op::Destroy(i) => {
                if !contexts.is_empty() {
                    let len = contexts.len();
                    contexts.swap_remove(i as usize % len);
                }
            }
            Op::Begin(i) => {
                if let Some(ctx) = pick(&mut contexts, i) {
                    let _ = ctx.begin_generate();
                }
            }
            Op::Generate { ctx, offset, tokens } => {
                if let Some(ctx) = pick(&mut contexts, ctx) {
                    let tokens: Vec<u32> = tokens.iter().map(|&b| b as u32 + 3).collect();
                    let _ = ctx.generate_next(&tokens, offset as u32 % (MAX_CONTEXT_LENGTH + 2));
                }
            }
            Op::End(i) => {
                if let Some(ctx) = pick(&mut contexts, i) {
                    let _ = ctx.end_generate();
                }
            }
        }
        check(&session, &driver);
    }

    drop(contexts);
    drop(session);
    assert_eq!(driver.live_contexts(), 0);
});
