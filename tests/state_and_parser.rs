//! Integration tests over the pure-logic pieces that don't require live
//! hardware access: counter-state aggregation and the event-definition
//! text parser.

use pcm_core::event_parser::{parse_event_file, DescriptorBuilder, FieldKey, FieldValue};
use pcm_core::state::{CoreCounterState, PCM_CORRUPTED_COUNTER};

#[test]
fn core_state_addition_is_associative() {
    let a = CoreCounterState { instructions_retired: 10, gp_counters: vec![1, 2], ..Default::default() };
    let b = CoreCounterState { instructions_retired: 20, gp_counters: vec![3, 4], ..Default::default() };
    let c = CoreCounterState { instructions_retired: 30, gp_counters: vec![5, 6], ..Default::default() };

    let left = (a.clone() + b.clone()) + c.clone();
    let right = a + (b + c);
    assert_eq!(left, right);
}

#[test]
fn corrupted_gp_counter_reports_sentinel_through_accessor() {
    let state = CoreCounterState { gp_counters: vec![42, 100], corrupted: vec![false, true], ..Default::default() };
    assert_eq!(state.gp_counter(0), 42);
    assert_eq!(state.gp_counter(1), PCM_CORRUPTED_COUNTER);
}

#[test]
fn event_file_parses_multiple_lines_and_skips_comments_and_blanks() {
    let text = "\
# core counters
hname=UNHALTED_CORE_CYCLES,vname=cycles,ctr=0,ev_sel=0x3C,umask=0x00,en=1

hname=INSTRUCTIONS_RETIRED,vname=instructions,ctr=1,ev_sel=0xC0,umask=0x00,en=1
";
    let descriptors = parse_event_file(text, DescriptorBuilder::default).unwrap();
    assert_eq!(descriptors.len(), 2);
    assert_eq!(
        descriptors[0].get(&FieldKey::HName),
        Some(&FieldValue::Text("UNHALTED_CORE_CYCLES".to_string()))
    );
    assert_eq!(descriptors[1].get(&FieldKey::Ctr), Some(&FieldValue::Number(1)));
}
