use super::*;
use log::debug;

pub(super) fn progress(state: &mut ConsensusState, event: ConsensusEvent) -> Vec<ConsensusResponse> {
    let time = event.time();
    let mut responses = match event {
        ConsensusEvent::Start { time } => {
            if state.step != ConsensusStep::Initial {
                debug!("ignoring Start: machine already running");
                Vec::new()
            } else {
                start_round(state, 0, time)
            }
        }
        ConsensusEvent::BlockProposalReceived {
            proposal,
            round,
            time,
        } => on_proposal(state, proposal, round, time),
        ConsensusEvent::PrevoteQuorum {
            proposal,
            round,
            time,
        } => on_prevote_quorum(state, proposal, round, time),
        ConsensusEvent::PrecommitQuorum {
            proposal,
            round,
            time,
        } => on_precommit_quorum(state, proposal, round, time),
        ConsensusEvent::Timer { .. } => Vec::new(),
    };
    responses.append(&mut fire_expired_timeout(state, time));
    responses
}

fn start_round(state: &mut ConsensusState, round: Round, time: Timestamp) -> Vec<ConsensusResponse> {
    state.round = round;
    state.step = ConsensusStep::Propose;
    state.pending_timeout = None;

    let info = &state.height_info;
    let proposer = decide_proposer(info.height, round, info.validator_count);
    if info.this_node_index == Some(proposer) {
        vec![ConsensusResponse::BroadcastProposal {
            proposal: state.locked_value,
            round,
        }]
    } else {
        schedule_timeout(state, ConsensusStep::Propose, time);
        Vec::new()
    }
}

fn on_proposal(
    state: &mut ConsensusState,
    proposal: BlockIdentifier,
    round: Round,
    time: Timestamp,
) -> Vec<ConsensusResponse> {
    if round != state.round || state.step != ConsensusStep::Propose {
        debug!(
            "ignoring proposal for round {round}: at round {} step {:?}",
            state.round, state.step
        );
        return Vec::new();
    }
    // The lock rule: prevote the proposal only if it does not conflict with
    // a held lock.
    let favor = match state.locked_value {
        None => true,
        Some(locked) => locked == proposal,
    };
    state.step = ConsensusStep::Prevote;
    schedule_timeout(state, ConsensusStep::Prevote, time);
    vec![ConsensusResponse::BroadcastPrevote {
        proposal: favor.then_some(proposal),
        round,
    }]
}

fn on_prevote_quorum(
    state: &mut ConsensusState,
    proposal: Option<BlockIdentifier>,
    round: Round,
    time: Timestamp,
) -> Vec<ConsensusResponse> {
    if round != state.round || state.step != ConsensusStep::Prevote {
        debug!(
            "ignoring prevote quorum for round {round}: at round {} step {:?}",
            state.round, state.step
        );
        return Vec::new();
    }
    if let Some(value) = proposal {
        state.locked_value = Some(value);
        state.locked_round = Some(round);
    }
    state.step = ConsensusStep::Precommit;
    schedule_timeout(state, ConsensusStep::Precommit, time);
    vec![ConsensusResponse::BroadcastPrecommit { proposal, round }]
}

fn on_precommit_quorum(
    state: &mut ConsensusState,
    proposal: Option<BlockIdentifier>,
    round: Round,
    time: Timestamp,
) -> Vec<ConsensusResponse> {
    if round != state.round || state.step != ConsensusStep::Precommit {
        debug!(
            "ignoring precommit quorum for round {round}: at round {} step {:?}",
            state.round, state.step
        );
        return Vec::new();
    }
    match proposal {
        Some(value) => {
            state.pending_timeout = None;
            vec![ConsensusResponse::FinalizeBlock {
                proposal: value,
                round,
            }]
        }
        None => start_round(state, round + 1, time),
    }
}

fn fire_expired_timeout(state: &mut ConsensusState, time: Timestamp) -> Vec<ConsensusResponse> {
    let Some(pending) = state.pending_timeout.clone() else {
        return Vec::new();
    };
    if time < pending.deadline {
        return Vec::new();
    }
    state.pending_timeout = None;
    // A stale tag means the machine already moved on.
    if pending.step != state.step || pending.round != state.round {
        return Vec::new();
    }
    let round = state.round;
    match pending.step {
        ConsensusStep::Propose => {
            state.step = ConsensusStep::Prevote;
            schedule_timeout(state, ConsensusStep::Prevote, time);
            vec![ConsensusResponse::BroadcastPrevote {
                proposal: None,
                round,
            }]
        }
        ConsensusStep::Prevote => {
            state.step = ConsensusStep::Precommit;
            schedule_timeout(state, ConsensusStep::Precommit, time);
            vec![ConsensusResponse::BroadcastPrecommit {
                proposal: None,
                round,
            }]
        }
        ConsensusStep::Precommit => start_round(state, round + 1, time),
        ConsensusStep::Initial => Vec::new(),
    }
}

fn schedule_timeout(state: &mut ConsensusState, step: ConsensusStep, time: Timestamp) {
    let params = &state.height_info.params;
    let base = match step {
        ConsensusStep::Propose => params.timeout_propose_ms,
        ConsensusStep::Prevote => params.timeout_prevote_ms,
        ConsensusStep::Precommit => params.timeout_precommit_ms,
        ConsensusStep::Initial => return,
    };
    let duration = base + state.round as u64 * params.timeout_delta_ms;
    state.pending_timeout = Some(PendingTimeout {
        step,
        round: state.round,
        deadline: time + duration,
    });
}
