//! Buffer pool arena
//!
//! Every received message lives in the receiver's pool until the receiver
//! frees it. Allocations are addressed by a generation-counted
//! [`BufferToken`]; freeing bumps the slot's generation, so a second free
//! of the same token is detected instead of corrupting a reused slot.

use crate::error::{IpcError, Result};

/// Handle to one pool allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferToken {
    pool: u32,
    index: u32,
    generation: u32,
}

impl BufferToken {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    entry: Option<(usize, T)>,
}

/// Generation-counted arena with byte accounting
///
/// `T` is whatever the owner needs to keep per allocation: delivery
/// metadata in the simulated driver, the kernel address on the device.
#[derive(Debug)]
pub struct Pool<T> {
    id: u32,
    capacity: usize,
    used: usize,
    slots: Vec<Slot<T>>,
    free_slots: Vec<u32>,
}

impl<T> Pool<T> {
    /// Create an empty pool of `capacity` bytes; `id` tags its tokens
    pub fn new(id: u32, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            used: 0,
            slots: Vec::new(),
            free_slots: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn available(&self) -> usize {
        self.capacity - self.used
    }

    /// Number of live allocations
    pub fn live(&self) -> usize {
        self.slots.len() - self.free_slots.len()
    }

    /// Reserve `size` bytes and remember `value` alongside them
    pub fn alloc(&mut self, size: usize, value: T) -> Result<BufferToken> {
        if size > self.available() {
            return Err(IpcError::PoolExhausted {
                requested: size,
                available: self.available(),
            });
        }
        let index = match self.free_slots.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.entry = Some((size, value));
        self.used += size;
        Ok(BufferToken {
            pool: self.id,
            index,
            generation: slot.generation,
        })
    }

    /// Look at a live allocation
    pub fn get(&self, token: BufferToken) -> Result<&T> {
        let slot = self.slot(token)?;
        match &slot.entry {
            Some((_, value)) if slot.generation == token.generation => Ok(value),
            _ => Err(IpcError::BufferAlreadyFreed),
        }
    }

    /// Release an allocation, returning its bytes to the pool
    pub fn free(&mut self, token: BufferToken) -> Result<T> {
        let slot = self.slot(token)?;
        if slot.generation != token.generation || slot.entry.is_none() {
            return Err(IpcError::BufferAlreadyFreed);
        }
        let slot = &mut self.slots[token.index as usize];
        let (size, value) = slot.entry.take().ok_or(IpcError::BufferAlreadyFreed)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.used -= size;
        self.free_slots.push(token.index);
        Ok(value)
    }

    /// Release every allocation
    pub fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some((_, value)) = slot.entry.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free_slots.push(index as u32);
                values.push(value);
            }
        }
        self.used = 0;
        values
    }

    fn slot(&self, token: BufferToken) -> Result<&Slot<T>> {
        if token.pool != self.id {
            return Err(IpcError::InvalidBuffer);
        }
        let slot = self
            .slots
            .get(token.index as usize)
            .ok_or(IpcError::InvalidBuffer)?;
        // A generation from the future was never issued by this pool
        if token.generation > slot.generation {
            return Err(IpcError::InvalidBuffer);
        }
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_free_account_bytes() {
        let mut pool = Pool::new(1, 100);
        let a = pool.alloc(40, 'a').unwrap();
        let b = pool.alloc(60, 'b').unwrap();
        assert_eq!(pool.available(), 0);
        assert_eq!(
            pool.alloc(1, 'c'),
            Err(IpcError::PoolExhausted {
                requested: 1,
                available: 0
            })
        );
        assert_eq!(pool.free(a), Ok('a'));
        assert_eq!(pool.available(), 40);
        assert_eq!(pool.get(b), Ok(&'b'));
        assert_eq!(pool.live(), 1);
    }

    #[test]
    fn double_free_is_detected() {
        let mut pool = Pool::new(1, 100);
        let a = pool.alloc(10, ()).unwrap();
        pool.free(a).unwrap();
        assert_eq!(pool.free(a), Err(IpcError::BufferAlreadyFreed));
        // Slot reuse must not revive the old token
        let b = pool.alloc(10, ()).unwrap();
        assert_eq!(b.index(), a.index());
        assert_ne!(b.generation(), a.generation());
        assert_eq!(pool.free(a), Err(IpcError::BufferAlreadyFreed));
        assert_eq!(pool.free(b), Ok(()));
    }

    #[test]
    fn foreign_token_is_rejected() {
        let mut mine = Pool::new(1, 100);
        let mut other = Pool::new(2, 100);
        let _ = mine.alloc(10, ()).unwrap();
        let theirs = other.alloc(10, ()).unwrap();
        assert_eq!(mine.free(theirs), Err(IpcError::InvalidBuffer));
    }

    #[test]
    fn drain_releases_everything() {
        let mut pool = Pool::new(1, 100);
        let a = pool.alloc(10, 1).unwrap();
        let _ = pool.alloc(20, 2).unwrap();
        assert_eq!(pool.drain(), vec![1, 2]);
        assert_eq!(pool.used(), 0);
        assert_eq!(pool.free(a), Err(IpcError::BufferAlreadyFreed));
    }
}
