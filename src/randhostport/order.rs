use parking_lot::Mutex;
use rand::Rng;
use std::ops::RangeInclusive;

/// Hands out host ports sequentially, wrapping from the end of the range back
/// to its start.
///
/// Ports are unique within one replica until the range wraps; nothing
/// coordinates across replicas.
#[derive(Debug)]
pub struct OrderAssigner {
    start: u16,
    end: u16,
    next: Mutex<u16>,
}

impl OrderAssigner {
    /// Starts at a random port so that replicas do not all hand out the same
    /// sequence.
    pub fn new(ports: RangeInclusive<u16>) -> Self {
        let next = rand::thread_rng().gen_range(ports.clone());
        Self::starting_at(ports, next)
    }

    pub fn starting_at(ports: RangeInclusive<u16>, next: u16) -> Self {
        let (start, end) = ports.into_inner();
        Self {
            start,
            end,
            next: Mutex::new(next.clamp(start, end)),
        }
    }

    pub fn next_port(&self) -> u16 {
        let mut next = self.next.lock();
        self.advance(&mut next)
    }

    /// Assigns `count` consecutive ports.
    pub fn assign(&self, count: usize) -> Vec<u16> {
        let mut next = self.next.lock();
        (0..count).map(|_| self.advance(&mut next)).collect()
    }

    fn advance(&self, next: &mut u16) -> u16 {
        let port = *next;
        *next = if port >= self.end {
            self.start
        } else {
            port + 1
        };
        port
    }
}
