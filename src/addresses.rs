//! Destination address sources

use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;

/// Supplies destination batches to the orchestrator
pub trait AddressSource: Send + Sync {
    fn generate(&self, count: usize) -> Vec<Address>;
}

/// Fresh, never-used addresses from newly created keys. The keys are discarded.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomAddressSource;

impl AddressSource for RandomAddressSource {
    fn generate(&self, count: usize) -> Vec<Address> {
        let mut rng = rand::thread_rng();
        (0..count)
            .map(|_| LocalWallet::new(&mut rng).address())
            .collect()
    }
}

/// Cycles through a fixed list of destinations
#[derive(Debug, Clone)]
pub struct StaticAddressSource {
    destinations: Vec<Address>,
}

impl StaticAddressSource {
    pub fn new(destinations: Vec<Address>) -> Self {
        Self { destinations }
    }
}

impl AddressSource for StaticAddressSource {
    fn generate(&self, count: usize) -> Vec<Address> {
        if self.destinations.is_empty() {
            return Vec::new();
        }
        self.destinations.iter().copied().cycle().take(count).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_random_addresses_are_distinct() {
        let batch = RandomAddressSource.generate(16);
        assert_eq!(batch.len(), 16);
        let unique: HashSet<_> = batch.iter().collect();
        assert_eq!(unique.len(), 16);
    }

    #[test]
    fn test_static_source_cycles() {
        let a = Address::repeat_byte(1);
        let b = Address::repeat_byte(2);
        let source = StaticAddressSource::new(vec![a, b]);
        assert_eq!(source.generate(3), vec![a, b, a]);
        assert!(StaticAddressSource::new(vec![]).generate(4).is_empty());
    }
}
