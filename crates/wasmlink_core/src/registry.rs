//! Fixed-capacity, CRC-verified resource registry.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::RegistryError;
use crate::integrity::crc16_ccitt;

/// Payload size of one resource (a 16x16 monochrome bitmap).
pub const RESOURCE_SIZE: usize = 32;

/// Reserved id meaning "no resource".
pub const INVALID_ID: u16 = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub id: u16,
    pub payload: [u8; RESOURCE_SIZE],
    pub crc16: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted { slot: usize },
    Updated { slot: usize },
}

/// Wire values of the verification status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum VerifyOutcome {
    #[default]
    Valid = 0,
    Invalid = 1,
    NotFound = 2,
    Error = 3,
}

impl VerifyOutcome {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Valid,
            1 => Self::Invalid,
            2 => Self::NotFound,
            _ => Self::Error,
        }
    }
}

/// Result of re-checking a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verification {
    pub id: u16,
    pub stored_crc16: u16,
    pub calculated_crc16: u16,
    pub outcome: VerifyOutcome,
}

/// Slots are `None` when free. Ids are unique across occupied slots.
#[derive(Debug)]
pub struct ResourceRegistry {
    slots: Box<[Option<RegistryEntry>]>,
}

impl ResourceRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity].into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    pub fn free_slots(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Insert or overwrite the entry for `id` after checking `declared_crc`
    /// against the payload.
    pub fn store(
        &mut self,
        id: u16,
        payload: &[u8; RESOURCE_SIZE],
        declared_crc: u16,
    ) -> Result<StoreOutcome, RegistryError> {
        if id == INVALID_ID {
            return Err(RegistryError::InvalidId(id));
        }

        let calculated = crc16_ccitt(payload);
        if calculated != declared_crc {
            warn!(id, declared = declared_crc, calculated, "resource crc mismatch");
            return Err(RegistryError::CrcMismatch {
                declared: declared_crc,
                calculated,
            });
        }

        let entry = RegistryEntry {
            id,
            payload: *payload,
            crc16: calculated,
        };

        if let Some(slot) = self.position(id) {
            self.slots[slot] = Some(entry);
            debug!(id, slot, "resource updated");
            return Ok(StoreOutcome::Updated { slot });
        }

        let Some(slot) = self.slots.iter().position(|s| s.is_none()) else {
            return Err(RegistryError::RegistryFull);
        };
        self.slots[slot] = Some(entry);
        debug!(id, slot, "resource stored");
        Ok(StoreOutcome::Inserted { slot })
    }

    pub fn fetch(&self, id: u16) -> Option<&RegistryEntry> {
        self.slots.iter().flatten().find(|e| e.id == id)
    }

    /// Raw payload access. Writes through here bypass the CRC, which
    /// [`verify`](Self::verify) then reports as `Invalid`.
    pub fn payload_mut(&mut self, id: u16) -> Option<&mut [u8; RESOURCE_SIZE]> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|e| e.id == id)
            .map(|e| &mut e.payload)
    }

    /// Recompute the CRC of the stored payload and compare it with the CRC
    /// recorded at upload time.
    pub fn verify(&self, id: u16) -> Verification {
        match self.fetch(id) {
            Some(entry) => {
                let calculated = crc16_ccitt(&entry.payload);
                Verification {
                    id,
                    stored_crc16: entry.crc16,
                    calculated_crc16: calculated,
                    outcome: if calculated == entry.crc16 {
                        VerifyOutcome::Valid
                    } else {
                        VerifyOutcome::Invalid
                    },
                }
            }
            None => Verification {
                id,
                stored_crc16: 0,
                calculated_crc16: 0,
                outcome: VerifyOutcome::NotFound,
            },
        }
    }

    pub fn clear_all(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }

    fn position(&self, id: u16) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|e| e.id == id))
    }
}
