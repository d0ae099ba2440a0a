use crate::types::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Runtime events — the durable audit trail for every process instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RuntimeEvent {
    InstanceStarted {
        instance_id: Uuid,
        model_version: [u8; 32],
    },
    ContinuationSpawned {
        cont_id: ContId,
        activity: ActId,
        parent: Option<ContId>,
    },
    WaitRegistered {
        cont_id: ContId,
        wait_id: WaitId,
        partner_link: String,
        operation: String,
    },
    MessageMatched {
        cont_id: ContId,
        wait_id: WaitId,
    },
    MessageRejected {
        partner_link: String,
        operation: String,
    },
    CorrelationInitiated {
        cset: CsetId,
        key: CorrelationKey,
    },
    VariableWritten {
        var: VarId,
    },
    InvokeSent {
        cont_id: ContId,
        mex_id: Option<MexId>,
        partner_link: String,
        operation: String,
    },
    ReplySent {
        cont_id: ContId,
        partner_link: String,
        operation: String,
        fault: Option<String>,
    },
    TimerArmed {
        wait_id: WaitId,
        deadline_ms: u64,
    },
    TimerFired {
        wait_id: WaitId,
    },
    PickArmDisarmed {
        cont_id: ContId,
        wait_id: WaitId,
    },
    FaultRaised {
        fault: FaultInfo,
    },
    FaultHandled {
        scope: ActId,
        fault_name: String,
    },
    /// Scope completed normally and was appended to the compensation log.
    ScopeCompensable {
        scope: ActId,
    },
    CompensationStarted {
        scope: ActId,
    },
    CompensationCompleted {
        scope: ActId,
    },
    SignalIgnored {
        description: String,
    },
    InstanceCompleted {
        at: Timestamp,
    },
    InstanceFaulted {
        fault: FaultInfo,
        at: Timestamp,
    },
    InstanceTerminated {
        at: Timestamp,
    },
}
