//! Command bus: per-unit queues, polling, and the central router.

pub mod queue;
pub mod router;

pub use queue::{
    command_queue, poll_commands, upstream_queue, CommandReceiver, CommandSender, PollCadence,
    Polled, Upstream,
};
pub use router::{Router, RouterSettings, UnitQueues};
