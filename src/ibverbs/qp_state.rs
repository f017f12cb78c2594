//! The queue pair state machine: which transitions exist and which attributes each of them takes.
//!
//! The native layer answers a bad `ibv_modify_qp` with a bare `EINVAL`. Checking the attribute mask
//! against these tables first lets [`QueuePair::modify`] report exactly which attributes are
//! missing and which are not allowed for the transition.
//!
//! The tables follow the `qp_state_table` of the Linux kernel, see
//! <https://elixir.bootlin.com/linux/v6.10.9/source/drivers/infiniband/core/verbs.c#L1385>.
//!
//! [`QueuePair::modify`]: super::queue_pair::QueuePair::modify
use std::sync::LazyLock;

use bitmask_enum::bitmask;
use rdma_mummy_sys::{ibv_qp_attr_mask, ibv_qp_state};
use serde::{Deserialize, Serialize};

use super::queue_pair::QueuePairType;

/// The state of a queue pair.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QueuePairState {
    Reset = ibv_qp_state::IBV_QPS_RESET,
    Init = ibv_qp_state::IBV_QPS_INIT,
    ReadyToReceive = ibv_qp_state::IBV_QPS_RTR,
    ReadyToSend = ibv_qp_state::IBV_QPS_RTS,
    SendQueueDrain = ibv_qp_state::IBV_QPS_SQD,
    SendQueueError = ibv_qp_state::IBV_QPS_SQE,
    Error = ibv_qp_state::IBV_QPS_ERR,
    Unknown = ibv_qp_state::IBV_QPS_UNKNOWN,
}

impl From<u32> for QueuePairState {
    fn from(state: u32) -> Self {
        match state {
            ibv_qp_state::IBV_QPS_RESET => QueuePairState::Reset,
            ibv_qp_state::IBV_QPS_INIT => QueuePairState::Init,
            ibv_qp_state::IBV_QPS_RTR => QueuePairState::ReadyToReceive,
            ibv_qp_state::IBV_QPS_RTS => QueuePairState::ReadyToSend,
            ibv_qp_state::IBV_QPS_SQD => QueuePairState::SendQueueDrain,
            ibv_qp_state::IBV_QPS_SQE => QueuePairState::SendQueueError,
            ibv_qp_state::IBV_QPS_ERR => QueuePairState::Error,
            ibv_qp_state::IBV_QPS_UNKNOWN => QueuePairState::Unknown,
            _ => panic!("Unknown qp state: {state}"),
        }
    }
}

// According to C standard, enums should be int, but Rust just uses whatever
// type returned by Clang, which is uint on Linux platforms, so just cast it
// into int.
//
// https://github.com/rust-lang/rust-bindgen/issues/1966
//
/// Mask of the [`QueuePairAttribute`], naming the fields to be modified or queried.
///
/// [`QueuePairAttribute`]: super::queue_pair::QueuePairAttribute
#[bitmask(i32)]
#[bitmask_config(vec_debug)]
pub enum QueuePairAttributeMask {
    State = ibv_qp_attr_mask::IBV_QP_STATE.0 as _,
    CurrentState = ibv_qp_attr_mask::IBV_QP_CUR_STATE.0 as _,
    EnableSendQueueDrainedAsyncNotify = ibv_qp_attr_mask::IBV_QP_EN_SQD_ASYNC_NOTIFY.0 as _,
    AccessFlags = ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS.0 as _,
    PartitionKeyIndex = ibv_qp_attr_mask::IBV_QP_PKEY_INDEX.0 as _,
    Port = ibv_qp_attr_mask::IBV_QP_PORT.0 as _,
    QueueKey = ibv_qp_attr_mask::IBV_QP_QKEY.0 as _,
    AddressVector = ibv_qp_attr_mask::IBV_QP_AV.0 as _,
    PathMtu = ibv_qp_attr_mask::IBV_QP_PATH_MTU.0 as _,
    Timeout = ibv_qp_attr_mask::IBV_QP_TIMEOUT.0 as _,
    RetryCount = ibv_qp_attr_mask::IBV_QP_RETRY_CNT.0 as _,
    ResponderNotReadyRetryCount = ibv_qp_attr_mask::IBV_QP_RNR_RETRY.0 as _,
    ReceiveQueuePacketSequenceNumber = ibv_qp_attr_mask::IBV_QP_RQ_PSN.0 as _,
    MaxReadAtomic = ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC.0 as _,
    AlternatePath = ibv_qp_attr_mask::IBV_QP_ALT_PATH.0 as _,
    MinResponderNotReadyTimer = ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER.0 as _,
    SendQueuePacketSequenceNumber = ibv_qp_attr_mask::IBV_QP_SQ_PSN.0 as _,
    MaxDestinationReadAtomic = ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC.0 as _,
    PathMigrationState = ibv_qp_attr_mask::IBV_QP_PATH_MIG_STATE.0 as _,
    Capabilities = ibv_qp_attr_mask::IBV_QP_CAP.0 as _,
    DestinationQueuePairNumber = ibv_qp_attr_mask::IBV_QP_DEST_QPN.0 as _,
    RateLimit = ibv_qp_attr_mask::IBV_QP_RATE_LIMIT.0 as _,
}

/// A pre-flight rejection of a state transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TransitionError {
    #[error("invalid transition from {cur_state:?} to {next_state:?}")]
    InvalidTransition {
        cur_state: QueuePairState,
        next_state: QueuePairState,
    },
    #[error("invalid attribute mask for transition from {cur_state:?} to {next_state:?}, forbidden {invalid:?}, missing {needed:?}")]
    InvalidAttributeMask {
        cur_state: QueuePairState,
        next_state: QueuePairState,
        /// Attributes supplied but not accepted by the transition.
        invalid: QueuePairAttributeMask,
        /// Attributes the transition requires but were not supplied.
        needed: QueuePairAttributeMask,
    },
}

/// The attributes a valid transition accepts. [`QueuePairAttributeMask::State`] is implied and
/// never listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRule {
    pub required: QueuePairAttributeMask,
    pub optional: QueuePairAttributeMask,
}

#[derive(Debug, Clone, Copy)]
enum Transport {
    ReliableConnection,
    UnreliableConnection,
    UnreliableDatagram,
}

impl Transport {
    fn of(qp_type: QueuePairType) -> Option<Transport> {
        match qp_type {
            QueuePairType::ReliableConnection => Some(Transport::ReliableConnection),
            QueuePairType::UnreliableConnection => Some(Transport::UnreliableConnection),
            QueuePairType::UnreliableDatagram => Some(Transport::UnreliableDatagram),
            _ => None,
        }
    }
}

const STATES: usize = QueuePairState::Error as usize + 1;

type StateTable = [[Option<TransitionRule>; STATES]; STATES];

static RC_TABLE: LazyLock<StateTable> = LazyLock::new(|| build_table(Transport::ReliableConnection));
static UC_TABLE: LazyLock<StateTable> = LazyLock::new(|| build_table(Transport::UnreliableConnection));
static UD_TABLE: LazyLock<StateTable> = LazyLock::new(|| build_table(Transport::UnreliableDatagram));

fn rule(required: QueuePairAttributeMask, optional: QueuePairAttributeMask) -> Option<TransitionRule> {
    Some(TransitionRule { required, optional })
}

fn build_table(transport: Transport) -> StateTable {
    use QueuePairAttributeMask as Mask;
    use QueuePairState::*;
    use Transport::*;

    let none = Mask::none();
    let mut table: StateTable = [[None; STATES]; STATES];

    // every state may go back to reset or into error
    for row in table.iter_mut() {
        row[Reset as usize] = rule(none, none);
        row[Error as usize] = rule(none, none);
    }

    let init_attrs = match transport {
        UnreliableDatagram => Mask::PartitionKeyIndex | Mask::Port | Mask::QueueKey,
        _ => Mask::PartitionKeyIndex | Mask::Port | Mask::AccessFlags,
    };
    table[Reset as usize][Init as usize] = rule(init_attrs, none);
    table[Init as usize][Init as usize] = rule(none, init_attrs);

    table[Init as usize][ReadyToReceive as usize] = match transport {
        ReliableConnection => rule(
            Mask::AddressVector
                | Mask::PathMtu
                | Mask::DestinationQueuePairNumber
                | Mask::ReceiveQueuePacketSequenceNumber
                | Mask::MaxDestinationReadAtomic
                | Mask::MinResponderNotReadyTimer,
            Mask::AlternatePath | Mask::AccessFlags | Mask::PartitionKeyIndex,
        ),
        UnreliableConnection => rule(
            Mask::AddressVector | Mask::PathMtu | Mask::DestinationQueuePairNumber | Mask::ReceiveQueuePacketSequenceNumber,
            Mask::AlternatePath | Mask::AccessFlags | Mask::PartitionKeyIndex,
        ),
        UnreliableDatagram => rule(none, Mask::PartitionKeyIndex | Mask::QueueKey),
    };

    let to_rts_optional = match transport {
        ReliableConnection => {
            Mask::CurrentState
                | Mask::AlternatePath
                | Mask::AccessFlags
                | Mask::MinResponderNotReadyTimer
                | Mask::PathMigrationState
        },
        UnreliableConnection => Mask::CurrentState | Mask::AlternatePath | Mask::AccessFlags | Mask::PathMigrationState,
        UnreliableDatagram => Mask::CurrentState | Mask::QueueKey,
    };
    table[ReadyToReceive as usize][ReadyToSend as usize] = match transport {
        ReliableConnection => rule(
            Mask::SendQueuePacketSequenceNumber
                | Mask::Timeout
                | Mask::RetryCount
                | Mask::ResponderNotReadyRetryCount
                | Mask::MaxReadAtomic,
            to_rts_optional,
        ),
        _ => rule(Mask::SendQueuePacketSequenceNumber, to_rts_optional),
    };
    table[ReadyToSend as usize][ReadyToSend as usize] = rule(none, to_rts_optional);
    table[SendQueueDrain as usize][ReadyToSend as usize] = rule(none, to_rts_optional);

    table[ReadyToSend as usize][SendQueueDrain as usize] = rule(none, Mask::EnableSendQueueDrainedAsyncNotify);
    table[SendQueueDrain as usize][SendQueueDrain as usize] = match transport {
        ReliableConnection => rule(
            none,
            Mask::Port
                | Mask::AddressVector
                | Mask::Timeout
                | Mask::RetryCount
                | Mask::ResponderNotReadyRetryCount
                | Mask::MaxReadAtomic
                | Mask::MaxDestinationReadAtomic
                | Mask::AlternatePath
                | Mask::AccessFlags
                | Mask::PartitionKeyIndex
                | Mask::MinResponderNotReadyTimer
                | Mask::PathMigrationState,
        ),
        UnreliableConnection => rule(
            none,
            Mask::AddressVector
                | Mask::AlternatePath
                | Mask::AccessFlags
                | Mask::PartitionKeyIndex
                | Mask::PathMigrationState,
        ),
        UnreliableDatagram => rule(none, Mask::PartitionKeyIndex | Mask::QueueKey),
    };

    table[SendQueueError as usize][ReadyToSend as usize] = match transport {
        UnreliableDatagram => rule(none, Mask::CurrentState | Mask::QueueKey),
        UnreliableConnection => rule(none, Mask::CurrentState | Mask::AccessFlags),
        // a reliable connection never enters SQE
        ReliableConnection => None,
    };

    table
}

/// The rule for moving a `qp_type` queue pair from `cur_state` to `next_state`.
///
/// Returns `None` if the transition does not exist, or if the tables do not cover `qp_type`.
pub fn transition_rule(
    qp_type: QueuePairType, cur_state: QueuePairState, next_state: QueuePairState,
) -> Option<TransitionRule> {
    let table = match Transport::of(qp_type)? {
        Transport::ReliableConnection => &*RC_TABLE,
        Transport::UnreliableConnection => &*UC_TABLE,
        Transport::UnreliableDatagram => &*UD_TABLE,
    };
    *table.get(cur_state as usize)?.get(next_state as usize)?
}

#[inline]
pub(crate) fn get_needed_mask(
    cur_mask: QueuePairAttributeMask, required_mask: QueuePairAttributeMask,
) -> QueuePairAttributeMask {
    required_mask.and(required_mask.xor(cur_mask))
}

#[inline]
pub(crate) fn get_invalid_mask(
    cur_mask: QueuePairAttributeMask, required_mask: QueuePairAttributeMask, optional_mask: QueuePairAttributeMask,
) -> QueuePairAttributeMask {
    cur_mask.and(required_mask.or(optional_mask).not())
}

/// Check `attr_mask` against the transition from `cur_state` to `next_state`.
///
/// Queue pair types without a table (XRC, raw packet) and queue pairs in an unknown state are
/// passed through for the native layer to judge.
pub fn check_transition(
    qp_type: QueuePairType, cur_state: QueuePairState, next_state: QueuePairState, attr_mask: QueuePairAttributeMask,
) -> Result<(), TransitionError> {
    if Transport::of(qp_type).is_none() || cur_state == QueuePairState::Unknown {
        return Ok(());
    }

    let Some(rule) = transition_rule(qp_type, cur_state, next_state) else {
        return Err(TransitionError::InvalidTransition { cur_state, next_state });
    };

    let supplied = attr_mask.and(QueuePairAttributeMask::State.not());
    let invalid = get_invalid_mask(supplied, rule.required, rule.optional);
    let needed = get_needed_mask(supplied, rule.required);
    if invalid.is_none() && needed.is_none() {
        Ok(())
    } else {
        Err(TransitionError::InvalidAttributeMask {
            cur_state,
            next_state,
            invalid,
            needed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;
    use QueuePairAttributeMask as Mask;
    use QueuePairState::*;

    const ALL_ATTRIBUTES: [Mask; 21] = [
        Mask::CurrentState,
        Mask::EnableSendQueueDrainedAsyncNotify,
        Mask::AccessFlags,
        Mask::PartitionKeyIndex,
        Mask::Port,
        Mask::QueueKey,
        Mask::AddressVector,
        Mask::PathMtu,
        Mask::Timeout,
        Mask::RetryCount,
        Mask::ResponderNotReadyRetryCount,
        Mask::ReceiveQueuePacketSequenceNumber,
        Mask::MaxReadAtomic,
        Mask::AlternatePath,
        Mask::MinResponderNotReadyTimer,
        Mask::SendQueuePacketSequenceNumber,
        Mask::MaxDestinationReadAtomic,
        Mask::PathMigrationState,
        Mask::Capabilities,
        Mask::DestinationQueuePairNumber,
        Mask::RateLimit,
    ];

    fn rc_rule(cur: QueuePairState, next: QueuePairState) -> TransitionRule {
        transition_rule(QueuePairType::ReliableConnection, cur, next).unwrap()
    }

    #[rstest]
    #[case(Reset, Init)]
    #[case(Init, ReadyToReceive)]
    #[case(ReadyToReceive, ReadyToSend)]
    fn test_rc_accepts_required_and_any_optional(#[case] cur: QueuePairState, #[case] next: QueuePairState) {
        let rule = rc_rule(cur, next);
        let rc = QueuePairType::ReliableConnection;

        assert_eq!(check_transition(rc, cur, next, rule.required | Mask::State), Ok(()));
        assert_eq!(check_transition(rc, cur, next, rule.required | rule.optional | Mask::State), Ok(()));
        for attr in ALL_ATTRIBUTES.into_iter().filter(|attr| rule.optional.contains(*attr)) {
            assert_eq!(check_transition(rc, cur, next, rule.required | attr | Mask::State), Ok(()));
        }
    }

    #[rstest]
    #[case(Reset, Init)]
    #[case(Init, ReadyToReceive)]
    #[case(ReadyToReceive, ReadyToSend)]
    fn test_rc_names_each_missing_and_forbidden_attribute(#[case] cur: QueuePairState, #[case] next: QueuePairState) {
        let rule = rc_rule(cur, next);
        let rc = QueuePairType::ReliableConnection;

        for attr in ALL_ATTRIBUTES {
            if rule.required.contains(attr) {
                let mask = rule.required.and(attr.not()) | Mask::State;
                assert_eq!(
                    check_transition(rc, cur, next, mask),
                    Err(TransitionError::InvalidAttributeMask {
                        cur_state: cur,
                        next_state: next,
                        invalid: Mask::none(),
                        needed: attr,
                    }),
                    "dropping {attr:?}"
                );
            } else if !rule.optional.contains(attr) {
                let mask = rule.required | attr | Mask::State;
                assert_eq!(
                    check_transition(rc, cur, next, mask),
                    Err(TransitionError::InvalidAttributeMask {
                        cur_state: cur,
                        next_state: next,
                        invalid: attr,
                        needed: Mask::none(),
                    }),
                    "adding {attr:?}"
                );
            }
        }
    }

    #[test]
    fn test_rc_rtr_requires_routing() {
        let rule = rc_rule(Init, ReadyToReceive);
        for attr in [
            Mask::AddressVector,
            Mask::PathMtu,
            Mask::DestinationQueuePairNumber,
            Mask::ReceiveQueuePacketSequenceNumber,
        ] {
            assert!(rule.required.contains(attr));
        }
    }

    #[rstest]
    #[case(QueuePairType::ReliableConnection, Reset, ReadyToSend)]
    #[case(QueuePairType::ReliableConnection, Init, ReadyToSend)]
    #[case(QueuePairType::ReliableConnection, Error, Init)]
    #[case(QueuePairType::ReliableConnection, SendQueueError, ReadyToSend)]
    #[case(QueuePairType::UnreliableDatagram, ReadyToReceive, Init)]
    fn test_invalid_transitions(#[case] qp_type: QueuePairType, #[case] cur: QueuePairState, #[case] next: QueuePairState) {
        assert_eq!(
            check_transition(qp_type, cur, next, Mask::State),
            Err(TransitionError::InvalidTransition {
                cur_state: cur,
                next_state: next
            })
        );
    }

    #[test]
    fn test_transport_specific_rules() {
        let ud = transition_rule(QueuePairType::UnreliableDatagram, Reset, Init).unwrap();
        assert!(ud.required.contains(Mask::QueueKey));
        assert!(!ud.required.contains(Mask::AccessFlags));

        let uc = transition_rule(QueuePairType::UnreliableConnection, Init, ReadyToReceive).unwrap();
        assert!(!uc.required.contains(Mask::MaxDestinationReadAtomic));

        let ud_rtr = transition_rule(QueuePairType::UnreliableDatagram, Init, ReadyToReceive).unwrap();
        assert!(ud_rtr.required.is_none());
    }

    #[test]
    fn test_unchecked_types_pass_through() {
        assert_eq!(
            check_transition(QueuePairType::RawPacket, Reset, ReadyToSend, Mask::State | Mask::RateLimit),
            Ok(())
        );
        assert_eq!(
            check_transition(QueuePairType::ReliableConnection, Unknown, ReadyToSend, Mask::State),
            Ok(())
        );
    }

    #[test]
    fn test_mask_helpers() {
        let required = Mask::Port | Mask::AccessFlags;
        assert_eq!(get_needed_mask(Mask::Port, required), Mask::AccessFlags);
        assert_eq!(get_invalid_mask(Mask::Port | Mask::Timeout, required, Mask::none()), Mask::Timeout);
    }

    #[test]
    fn test_state_serde() {
        assert_eq!(serde_json::to_string(&ReadyToSend).unwrap(), "\"ReadyToSend\"");
        let state: QueuePairState = serde_json::from_str("\"Init\"").unwrap();
        assert_eq!(state, Init);
    }

    fn arbitrary_mask() -> impl Strategy<Value = Mask> {
        proptest::collection::vec(proptest::sample::select(ALL_ATTRIBUTES.to_vec()), 0..8)
            .prop_map(|attrs| attrs.into_iter().fold(Mask::none(), |mask, attr| mask | attr))
    }

    proptest! {
        #[test]
        fn test_rc_validator_matches_rule(
            step in 0usize..3,
            mask in arbitrary_mask(),
        ) {
            let (cur, next) = [(Reset, Init), (Init, ReadyToReceive), (ReadyToReceive, ReadyToSend)][step];
            let rule = rc_rule(cur, next);
            let accepted = mask.and(rule.required) == rule.required
                && mask.and(rule.required.or(rule.optional).not()).is_none();

            let result = check_transition(QueuePairType::ReliableConnection, cur, next, mask | Mask::State);
            prop_assert_eq!(result.is_ok(), accepted);
            if let Err(TransitionError::InvalidAttributeMask { invalid, needed, .. }) = result {
                prop_assert_eq!(invalid, mask.and(rule.required.or(rule.optional).not()));
                prop_assert_eq!(needed, rule.required.and(mask.not()));
            }
        }

        #[test]
        fn test_qp_state_conversion(state in 0u32..=16u32) {
            if let Ok(qp_state) = std::panic::catch_unwind(|| QueuePairState::from(state)) {
                prop_assert_eq!(state, qp_state as u32);
            } else {
                prop_assert!(state > ibv_qp_state::IBV_QPS_UNKNOWN);
            }
        }
    }
}
