#![forbid(unsafe_code)]

pub mod config;
pub mod core;
pub mod proto;
pub mod pull;

pub use crate::config::{PullMode, PullOptions};
pub use crate::core::{
    ActivityLevel, DocumentEnded, Limits, ParsedRev, Progress, PullStatus, PulledRev, RemoteSeq,
    ReplyError, RevError, RevFlags, StoreError,
};
pub use crate::proto::{ChangeEntry, ChangesParseError, MessageIn, MessageNo, Profile, SubChanges};
pub use crate::pull::{
    DocIdSet, IncomingRev, MissingSequenceSet, PullDelegate, PullStore, PullTransport, Puller,
    PullerAction, PullerCounters, PullerEvent, PullerHandle, RevBatcher, RevParser,
    SharedPullStore,
};
