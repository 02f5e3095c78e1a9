use mockall::mock;
use tempo_core::time::{ClockSource, HostTimeSync, TimeInterval};
use tempo_core::tracer::{Disassembled, Disassembler};

mock! {
    pub Clock {}
    impl ClockSource for Clock {
        fn nearest_limit_in(&self) -> TimeInterval;
    }
}

mock! {
    pub HostSync {}
    impl HostTimeSync for HostSync {
        fn advance_immediately(&self) -> bool;
        fn virtual_time_ahead_of_host(&self) -> TimeInterval;
    }
}

mock! {
    pub Disassembler {}
    impl Disassembler for Disassembler {
        fn disassemble(&self, pc: u64, bytes: &[u8]) -> Option<Disassembled>;
    }
}
