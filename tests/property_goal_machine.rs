//! Property tests over the canonical serialization and the goal state
//! machine.

mod common;

use common::goal_event;
use proptest::prelude::*;
use stevedore::domain::models::GoalState;
use stevedore::services::signing::canonical_form;

const ALL_STATES: [GoalState; 12] = [
    GoalState::Planned,
    GoalState::Requested,
    GoalState::WaitingForPreApproval,
    GoalState::PreApproved,
    GoalState::WaitingForApproval,
    GoalState::Approved,
    GoalState::InProcess,
    GoalState::Success,
    GoalState::Failure,
    GoalState::Skipped,
    GoalState::Stopped,
    GoalState::Canceled,
];

fn arb_state() -> impl Strategy<Value = GoalState> {
    prop::sample::select(ALL_STATES.to_vec())
}

fn arb_ident() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,16}"
}

fn arb_sha() -> impl Strategy<Value = String> {
    "[0-9a-f]{12}"
}

proptest! {
    /// Two goal events differing in any of the minimal signed fields
    /// produce different canonical strings.
    #[test]
    fn canonical_form_is_injective_on_signed_fields(
        name_a in arb_ident(), name_b in arb_ident(),
        set_a in arb_ident(), set_b in arb_ident(),
        state_a in arb_state(), state_b in arb_state(),
        sha_a in arb_sha(), sha_b in arb_sha(),
        ts_a in 0i64..=2_000_000_000_000, ts_b in 0i64..=2_000_000_000_000,
    ) {
        let mut a = goal_event("set", "goal", GoalState::Requested);
        a.unique_name = name_a.clone();
        a.goal_set_id = set_a.clone();
        a.state = state_a;
        a.sha = sha_a.clone();
        a.ts = ts_a;

        let mut b = goal_event("set", "goal", GoalState::Requested);
        b.unique_name = name_b.clone();
        b.goal_set_id = set_b.clone();
        b.state = state_b;
        b.sha = sha_b.clone();
        b.ts = ts_b;

        let differs = name_a != name_b
            || set_a != set_b
            || state_a != state_b
            || sha_a != sha_b
            || ts_a != ts_b;
        if differs {
            prop_assert_ne!(canonical_form(&a), canonical_form(&b));
        } else {
            prop_assert_eq!(canonical_form(&a), canonical_form(&b));
        }
    }

    /// Terminal states admit no ordinary transition at all.
    #[test]
    fn terminal_states_are_absorbing(from in arb_state(), to in arb_state()) {
        if from.is_terminal() {
            prop_assert!(!from.can_transition_to(to));
        }
    }

    /// Every non-terminal state may be canceled.
    #[test]
    fn non_terminal_states_are_cancelable(state in arb_state()) {
        if !state.is_terminal() {
            prop_assert!(state.can_transition_to(GoalState::Canceled));
        }
    }

    /// The transition table only contains states reachable per the
    /// lifecycle: no transition ever re-enters planned.
    #[test]
    fn planned_is_never_reentered(from in arb_state()) {
        prop_assert!(!from.can_transition_to(GoalState::Planned));
    }
}

#[test]
fn canonical_form_is_stable_for_equal_events() {
    let a = goal_event("set-1", "build", GoalState::Requested);
    let b = goal_event("set-1", "build", GoalState::Requested);
    assert_eq!(canonical_form(&a), canonical_form(&b));
}
