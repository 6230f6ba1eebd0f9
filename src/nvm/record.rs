use super::store::{NvmAction, NvmError, NvmStore, TAIL_LEN};

/// A typed value persisted as one record.
pub trait Record: Sized {
    /// Storage key.
    const KEY: &'static str;
    /// Encoded content length, excluding the integrity tail.
    const SIZE: usize;

    fn encode(&self, out: &mut [u8]);

    /// Decode content bytes. Out-of-range fields fall back to defaults.
    fn decode(bytes: &[u8]) -> Self;

    fn defaults() -> Self;
}

/// Typed value plus the byte image it is reconciled through.
#[derive(Debug, Clone)]
pub struct NvmRecord<R: Record> {
    value: R,
    image: Vec<u8>,
}

impl<R: Record> NvmRecord<R> {
    /// Unsynced record holding defaults. The zeroed image has no valid
    /// magic, so the first [`NvmRecord::sync`] loads from storage.
    pub fn new() -> Self {
        Self {
            value: R::defaults(),
            image: vec![0; R::SIZE + TAIL_LEN],
        }
    }

    /// Build and synchronise a record in one step.
    pub fn load(store: &NvmStore) -> Result<Self, NvmError> {
        let mut record = Self::new();
        record.sync(store)?;
        Ok(record)
    }

    pub fn get(&self) -> &R {
        &self.value
    }

    /// Mutable access. Changes persist on the next [`NvmRecord::sync`].
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.value
    }

    /// Reconcile the value with storage.
    pub fn sync(&mut self, store: &NvmStore) -> Result<NvmAction, NvmError> {
        self.value.encode(&mut self.image[..R::SIZE]);
        let action = store.handle_change(R::KEY, &mut self.image, |content| {
            R::defaults().encode(content)
        })?;
        self.value = R::decode(&self.image[..R::SIZE]);
        Ok(action)
    }

    /// Replace the value with defaults and persist it.
    pub fn reset(&mut self, store: &NvmStore) -> Result<NvmAction, NvmError> {
        self.value = R::defaults();
        self.sync(store)
    }
}

impl<R: Record> Default for NvmRecord<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvm::MemStorage;

    #[derive(Debug, Clone, PartialEq)]
    struct Counter {
        boots: u32,
        label: u8,
    }

    impl Record for Counter {
        const KEY: &'static str = "counter";
        const SIZE: usize = 5;

        fn encode(&self, out: &mut [u8]) {
            out[..4].copy_from_slice(&self.boots.to_le_bytes());
            out[4] = self.label;
        }

        fn decode(bytes: &[u8]) -> Self {
            Self {
                boots: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                label: bytes[4],
            }
        }

        fn defaults() -> Self {
            Self { boots: 0, label: b'd' }
        }
    }

    #[test]
    fn test_record_survives_restart() {
        let backend = MemStorage::new();
        {
            let store = NvmStore::new(Box::new(backend.clone()));
            let mut rec = NvmRecord::<Counter>::load(&store).unwrap();
            assert_eq!(rec.get(), &Counter::defaults());
            rec.get_mut().boots = 3;
            assert_eq!(rec.sync(&store).unwrap(), NvmAction::Updated);
        }

        let store = NvmStore::new(Box::new(backend.clone()));
        let mut rec = NvmRecord::<Counter>::new();
        assert_eq!(rec.sync(&store).unwrap(), NvmAction::LoadSuccess);
        assert_eq!(rec.get().boots, 3);
        assert_eq!(backend.writes(), 2);
    }

    #[test]
    fn test_reset_restores_defaults() {
        let store = NvmStore::new(Box::new(MemStorage::new()));
        let mut rec = NvmRecord::<Counter>::load(&store).unwrap();
        rec.get_mut().label = b'x';
        rec.sync(&store).unwrap();
        assert_eq!(rec.reset(&store).unwrap(), NvmAction::Updated);
        assert_eq!(rec.get().label, b'd');
    }
}
