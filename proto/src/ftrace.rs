//! Kernel event messages emitted by the ftrace engine.
//!
//! The page parser writes these messages field-by-field from its
//! translation table; the tag constants in [`bundle`] and [`event`] are the
//! single source of truth for the field numbers it targets.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FtraceEventBundle {
    #[prost(uint32, optional, tag = "1")]
    pub cpu: Option<u32>,
    #[prost(message, repeated, tag = "2")]
    pub event: Vec<FtraceEvent>,
    /// Kernel pages lost to ring-buffer overwrite while this bundle was
    /// being filled.
    #[prost(uint32, optional, tag = "3")]
    pub overwrite_count: Option<u32>,
}

/// Field numbers of [`FtraceEventBundle`].
pub mod bundle {
    pub const CPU: u32 = 1;
    pub const EVENT: u32 = 2;
    pub const OVERWRITE_COUNT: u32 = 3;
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FtraceEvent {
    #[prost(uint64, optional, tag = "1")]
    pub timestamp: Option<u64>,
    /// Common field, present on every kernel event record.
    #[prost(int32, optional, tag = "2")]
    pub pid: Option<i32>,
    #[prost(oneof = "ftrace_event::Event", tags = "3, 4, 5, 6")]
    pub event: Option<ftrace_event::Event>,
}

pub mod ftrace_event {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Event {
        #[prost(message, tag = "3")]
        Print(super::PrintFtraceEvent),
        #[prost(message, tag = "4")]
        SchedSwitch(super::SchedSwitchFtraceEvent),
        #[prost(message, tag = "5")]
        SchedWakeup(super::SchedWakeupFtraceEvent),
        /// Fallback for events the static info does not know; fields are
        /// carried as name/value pairs.
        #[prost(message, tag = "6")]
        Generic(super::GenericFtraceEvent),
    }
}

/// Field numbers of [`FtraceEvent`].
pub mod event {
    pub const TIMESTAMP: u32 = 1;
    pub const PID: u32 = 2;
    pub const PRINT: u32 = 3;
    pub const SCHED_SWITCH: u32 = 4;
    pub const SCHED_WAKEUP: u32 = 5;
    pub const GENERIC: u32 = 6;
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PrintFtraceEvent {
    #[prost(uint64, optional, tag = "1")]
    pub ip: Option<u64>,
    #[prost(string, optional, tag = "2")]
    pub buf: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SchedSwitchFtraceEvent {
    #[prost(string, optional, tag = "1")]
    pub prev_comm: Option<String>,
    #[prost(int32, optional, tag = "2")]
    pub prev_pid: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub prev_prio: Option<i32>,
    #[prost(int64, optional, tag = "4")]
    pub prev_state: Option<i64>,
    #[prost(string, optional, tag = "5")]
    pub next_comm: Option<String>,
    #[prost(int32, optional, tag = "6")]
    pub next_pid: Option<i32>,
    #[prost(int32, optional, tag = "7")]
    pub next_prio: Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SchedWakeupFtraceEvent {
    #[prost(string, optional, tag = "1")]
    pub comm: Option<String>,
    #[prost(int32, optional, tag = "2")]
    pub pid: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub prio: Option<i32>,
    #[prost(int32, optional, tag = "4")]
    pub success: Option<i32>,
    #[prost(int32, optional, tag = "5")]
    pub target_cpu: Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GenericFtraceEvent {
    #[prost(string, optional, tag = "1")]
    pub event_name: Option<String>,
    #[prost(message, repeated, tag = "2")]
    pub field: Vec<generic_ftrace_event::Field>,
}

pub mod generic_ftrace_event {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Field {
        #[prost(string, optional, tag = "1")]
        pub name: Option<String>,
        #[prost(oneof = "field::Value", tags = "3, 4, 5")]
        pub value: Option<field::Value>,
    }

    pub mod field {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Value {
            #[prost(string, tag = "3")]
            StrValue(String),
            #[prost(int64, tag = "4")]
            IntValue(i64),
            #[prost(uint64, tag = "5")]
            UintValue(u64),
        }
    }

    /// Field numbers of [`Field`].
    pub const NAME: u32 = 1;
    pub const STR_VALUE: u32 = 3;
    pub const INT_VALUE: u32 = 4;
    pub const UINT_VALUE: u32 = 5;
}

/// Field numbers of [`GenericFtraceEvent`].
pub mod generic {
    pub const EVENT_NAME: u32 = 1;
    pub const FIELD: u32 = 2;
}
