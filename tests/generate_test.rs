//! Tests for the generate state machine.

use std::sync::Arc;

use mux_core::driver::GenerateCall;
use mux_core::{ContextKind, Error, MockDriver, Session, SessionConfig};

fn setup(max_context_length: u32) -> (Arc<MockDriver>, Session) {
    let driver = Arc::new(MockDriver::with_context_length(max_context_length));
    let session = Session::new(driver.clone()).unwrap();
    (driver, session)
}

fn argmax(logits: &[f32]) -> usize {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap()
}

// =============================================================================
// State transitions
// =============================================================================

#[test]
fn generate_without_begin_is_invalid_and_changes_nothing() {
    let driver = Arc::new(MockDriver::with_context_length(8));
    let session =
        Session::with_config(driver.clone(), SessionConfig { preallocate: 1, ..Default::default() })
            .unwrap();
    let before = session.slots();
    let stats = session.pool_stats();

    let mut ctx = session.create_context(ContextKind::MinUpload).unwrap();
    let err = ctx.generate_next(&[1, 2], 0).unwrap_err();

    assert!(matches!(err, Error::Invalid(_)));
    assert!(!ctx.is_bound());
    assert!(!ctx.is_generating());
    assert_eq!(session.slots(), before);
    assert_eq!(session.pool_stats(), stats);
    assert!(driver.generate_calls().is_empty());
}

#[test]
fn begin_twice_is_invalid() {
    let (_driver, session) = setup(8);
    let mut ctx = session.create_context(ContextKind::MinDiscard).unwrap();
    ctx.begin_generate().unwrap();
    assert!(matches!(ctx.begin_generate(), Err(Error::Invalid(_))));
    assert!(ctx.is_generating());
}

#[test]
fn end_without_begin_is_invalid() {
    let (_driver, session) = setup(8);
    let mut ctx = session.create_context(ContextKind::Direct).unwrap();
    assert!(matches!(ctx.end_generate(), Err(Error::Invalid(_))));
}

#[test]
fn end_releases_slot_to_pool() {
    let (_driver, session) = setup(8);
    let mut ctx = session.create_context(ContextKind::MinUpload).unwrap();
    ctx.begin_generate().unwrap();
    ctx.generate_next(&[1, 2], 0).unwrap();
    assert_eq!(session.pool_stats().bound, 1);

    ctx.end_generate().unwrap();
    assert!(!ctx.is_bound());
    assert!(!ctx.is_generating());
    let stats = session.pool_stats();
    assert_eq!(stats.bound, 0);
    assert_eq!(stats.free, 1);
    assert_eq!(stats.resident_tokens, 2);
}

#[test]
fn context_can_generate_again_after_end() {
    let (driver, session) = setup(8);
    let mut ctx = session.create_context(ContextKind::MinUpload).unwrap();

    ctx.begin_generate().unwrap();
    ctx.generate_next(&[1, 2], 0).unwrap();
    ctx.end_generate().unwrap();
    driver.clear_generate_calls();

    ctx.begin_generate().unwrap();
    ctx.generate_next(&[3], 2).unwrap();
    ctx.end_generate().unwrap();

    // The whole conversation was resident already; only the new token is sent.
    assert_eq!(driver.generate_calls()[0].tokens, vec![3]);
    assert_eq!(driver.generate_calls()[0].offset, 2);
    assert_eq!(ctx.window(), &[1, 2, 3]);
}

// =============================================================================
// Bounds
// =============================================================================

#[test]
fn overflow_is_invalid() {
    let (driver, session) = setup(8);
    let mut ctx = session.create_context(ContextKind::MinUpload).unwrap();
    ctx.begin_generate().unwrap();

    assert!(matches!(ctx.generate_next(&[0; 9], 0), Err(Error::Invalid(_))));
    assert!(matches!(ctx.generate_next(&[1], 8), Err(Error::Invalid(_))));
    assert!(matches!(ctx.generate_next(&[1], u32::MAX), Err(Error::Invalid(_))));
    assert!(!ctx.is_bound());
    assert_eq!(session.pool_stats().total, 0);
    assert!(driver.generate_calls().is_empty());
}

#[test]
fn append_past_filled_size_is_invalid() {
    let (driver, session) = setup(8);
    let mut ctx = session.create_context(ContextKind::MinUpload).unwrap();
    ctx.begin_generate().unwrap();
    ctx.generate_next(&[1, 2], 0).unwrap();
    let before = session.slots();
    let calls = driver.generate_calls().len();

    assert!(matches!(ctx.generate_next(&[3], 5), Err(Error::Invalid(_))));
    assert_eq!(session.slots(), before);
    assert_eq!(driver.generate_calls().len(), calls);

    ctx.generate_next(&[3], 2).unwrap();
    assert_eq!(session.slots()[0].tokens, vec![1, 2, 3]);
}

#[test]
fn append_at_filled_size_with_no_tokens_reads_back_logits() {
    let (_driver, session) = setup(8);
    let mut ctx = session.create_context(ContextKind::MinUpload).unwrap();
    ctx.begin_generate().unwrap();
    ctx.generate_next(&[10, 11], 0).unwrap();

    let logits = ctx.generate_next(&[], 2).unwrap();
    assert_eq!(argmax(logits), 12);
}

// =============================================================================
// Data flow
// =============================================================================

#[test]
fn logits_come_from_last_evaluated_position() {
    let (_driver, session) = setup(16);
    let mut ctx = session.create_context(ContextKind::MinDiscard).unwrap();
    ctx.begin_generate().unwrap();
    let logits = ctx.generate_next(&[20, 21, 22], 0).unwrap();
    assert_eq!(logits.len(), session.model_info().vocab_size as usize);
    assert_eq!(argmax(logits), 23);
    assert_eq!(argmax(ctx.logits()), 23);
}

#[test]
fn end_copies_conversation_back() {
    let (_driver, session) = setup(16);
    let mut ctx = session.create_context(ContextKind::MinUpload).unwrap();
    ctx.begin_generate().unwrap();
    ctx.generate_next(&[1, 2, 3], 0).unwrap();
    ctx.generate_next(&[4], 3).unwrap();
    ctx.generate_next(&[5, 6], 4).unwrap();
    ctx.end_generate().unwrap();

    assert_eq!(ctx.window(), &[1, 2, 3, 4, 5, 6]);
}

#[test]
fn rewriting_mid_conversation_truncates() {
    let (_driver, session) = setup(16);
    let mut ctx = session.create_context(ContextKind::MinUpload).unwrap();
    ctx.begin_generate().unwrap();
    ctx.generate_next(&[1, 2, 3, 4], 0).unwrap();
    ctx.generate_next(&[7], 2).unwrap();
    ctx.end_generate().unwrap();

    assert_eq!(ctx.window(), &[1, 2, 7]);
    assert_eq!(session.slots()[0].filled_size, 3);
}

#[test]
fn conversation_survives_slot_reuse_by_another_context() {
    let (driver, session) = setup(8);
    let config = SessionConfig { max_physical_contexts: 1, ..Default::default() };
    let capped = Session::with_config(driver.clone(), config).unwrap();
    drop(session);

    let mut a = capped.create_context(ContextKind::MinUpload).unwrap();
    let mut b = capped.create_context(ContextKind::MinDiscard).unwrap();

    a.begin_generate().unwrap();
    a.generate_next(&[1, 2, 3], 0).unwrap();
    a.end_generate().unwrap();

    b.begin_generate().unwrap();
    b.generate_next(&[9, 9], 0).unwrap();
    b.end_generate().unwrap();
    driver.clear_generate_calls();

    // `a` lost its resident state, so its whole conversation is re-evaluated.
    a.begin_generate().unwrap();
    a.generate_next(&[4], 3).unwrap();
    a.end_generate().unwrap();

    let call = &driver.generate_calls()[0];
    assert_eq!(call.tokens, vec![1, 2, 3, 4]);
    assert_eq!(call.offset, 0);
    assert_eq!(a.window(), &[1, 2, 3, 4]);
}

#[test]
fn driver_failure_truncates_fill_to_evaluated_prefix() {
    let (driver, session) = setup(8);
    let mut ctx = session.create_context(ContextKind::MinUpload).unwrap();
    ctx.begin_generate().unwrap();
    ctx.generate_next(&[1, 2, 3], 0).unwrap();

    driver.set_fail_generate(true);
    assert!(matches!(ctx.generate_next(&[4, 5], 3), Err(Error::Io(_))));
    assert!(ctx.is_bound(), "binding is kept until end_generate");
    assert_eq!(session.slots()[0].filled_size, 3);

    driver.set_fail_generate(false);
    ctx.generate_next(&[4], 3).unwrap();
    ctx.end_generate().unwrap();
    assert_eq!(ctx.window(), &[1, 2, 3, 4]);
}

#[test]
fn driver_failure_on_first_push_keeps_slot_consistent() {
    let (driver, session) = setup(8);
    driver.set_fail_generate(true);

    let mut ctx = session.create_context(ContextKind::MinUpload).unwrap();
    ctx.begin_generate().unwrap();
    assert!(ctx.generate_next(&[1, 2], 0).is_err());
    assert_eq!(session.slots()[0].filled_size, 0);
    ctx.end_generate().unwrap();
    assert!(ctx.window().is_empty());

    let descriptor = session.slots()[0].descriptor;
    assert_eq!(driver.slot_tokens(descriptor), Some(vec![]));
}

// =============================================================================
// Direct contexts
// =============================================================================

#[test]
fn direct_passes_offsets_through() {
    let (driver, session) = setup(8);
    let mut ctx = session.create_context(ContextKind::Direct).unwrap();
    let descriptor = ctx.descriptor().unwrap();

    ctx.begin_generate().unwrap();
    ctx.generate_next(&[1, 2], 0).unwrap();
    ctx.generate_next(&[3], 2).unwrap();
    ctx.end_generate().unwrap();

    assert_eq!(
        driver.generate_calls(),
        vec![
            GenerateCall { descriptor, tokens: vec![1, 2], offset: 0 },
            GenerateCall { descriptor, tokens: vec![3], offset: 2 },
        ]
    );
    assert!(ctx.window().is_empty());
    assert_eq!(session.pool_stats().total, 0);
    assert_eq!(session.pool_stats().dedicated, 1);
}

#[test]
fn direct_keeps_its_slot_across_generations() {
    let (driver, session) = setup(8);
    let mut ctx = session.create_context(ContextKind::Direct).unwrap();
    let descriptor = ctx.descriptor();

    ctx.begin_generate().unwrap();
    ctx.generate_next(&[1], 0).unwrap();
    ctx.end_generate().unwrap();

    ctx.begin_generate().unwrap();
    ctx.generate_next(&[2], 1).unwrap();
    ctx.end_generate().unwrap();

    assert_eq!(ctx.descriptor(), descriptor);
    assert_eq!(driver.slot_tokens(descriptor.unwrap()), Some(vec![1, 2]));
}

#[test]
fn direct_driver_errors_propagate() {
    let (_driver, session) = setup(8);
    let mut ctx = session.create_context(ContextKind::Direct).unwrap();
    ctx.begin_generate().unwrap();
    // The mock rejects evaluation past the tokens it already holds.
    assert!(matches!(ctx.generate_next(&[1], 3), Err(Error::Invalid(_))));
}

// =============================================================================
// Scoped generations and teardown
// =============================================================================

#[test]
fn generation_guard_ends_on_drop() {
    let (_driver, session) = setup(8);
    let mut ctx = session.create_context(ContextKind::MinUpload).unwrap();
    {
        let mut generation = ctx.generation().unwrap();
        generation.step(&[1, 2], 0).unwrap();
        assert!(generation.context().is_bound());
    }
    assert!(!ctx.is_generating());
    assert!(!ctx.is_bound());
    assert_eq!(ctx.window(), &[1, 2]);
    assert_eq!(session.pool_stats().bound, 0);
}

#[test]
fn generation_guard_explicit_end() {
    let (_driver, session) = setup(8);
    let mut ctx = session.create_context(ContextKind::MinDiscard).unwrap();
    let mut generation = ctx.generation().unwrap();
    generation.step(&[4], 0).unwrap();
    generation.end().unwrap();
    assert!(!ctx.is_generating());
}

#[test]
fn dropping_generating_context_frees_slot() {
    let (_driver, session) = setup(8);
    let ctx_id;
    {
        let mut ctx = session.create_context(ContextKind::MinUpload).unwrap();
        ctx_id = ctx.id();
        ctx.begin_generate().unwrap();
        ctx.generate_next(&[1, 2, 3], 0).unwrap();
    }
    let slots = session.slots();
    assert_eq!(slots[0].owner, None);
    assert_ne!(slots[0].owner, Some(ctx_id));
    assert_eq!(slots[0].tokens, vec![1, 2, 3]);
}

#[test]
fn failed_bind_leaves_saved_conversation_untouched() {
    let driver = Arc::new(MockDriver::with_context_length(8));
    let config = SessionConfig { max_physical_contexts: 1, ..Default::default() };
    let session = Session::with_config(driver.clone(), config).unwrap();

    let mut a = session.create_context(ContextKind::MinUpload).unwrap();
    let mut b = session.create_context(ContextKind::MinUpload).unwrap();
    a.begin_generate().unwrap();
    a.generate_next(&[1, 2, 3], 0).unwrap();
    a.end_generate().unwrap();

    b.begin_generate().unwrap();
    b.generate_next(&[7], 0).unwrap();

    a.begin_generate().unwrap();
    assert_eq!(a.generate_next(&[9], 1).unwrap_err(), Error::Oom);
    a.end_generate().unwrap();
    assert_eq!(a.window(), &[1, 2, 3]);

    b.end_generate().unwrap();
    driver.clear_generate_calls();

    a.begin_generate().unwrap();
    a.generate_next(&[4], 3).unwrap();
    a.end_generate().unwrap();

    let call = &driver.generate_calls()[0];
    assert_eq!(call.tokens, vec![1, 2, 3, 4]);
    assert_eq!(call.offset, 0);
    assert_eq!(a.window(), &[1, 2, 3, 4]);
}
