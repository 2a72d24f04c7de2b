//! GATT identifiers of the Anki Drive vehicle service.
//!
//! A vehicle exposes one primary service with two characteristics: one the
//! host writes commands to, and one the vehicle notifies on.  Roles are
//! assigned by UUID, never by the order in which the stack reports them.

use thiserror::Error;
use uuid::Uuid;

/// Primary vehicle service.
pub const VEHICLE_SERVICE_UUID: Uuid = Uuid::from_u128(0xbe15beef_6186_407e_8381_0bd89c4d8df4);

/// Characteristic the vehicle sends notifications on.
pub const VEHICLE_READ_UUID: Uuid = Uuid::from_u128(0xbe15bee0_6186_407e_8381_0bd89c4d8df4);

/// Characteristic the host writes commands to.
pub const VEHICLE_WRITE_UUID: Uuid = Uuid::from_u128(0xbe15bee1_6186_407e_8381_0bd89c4d8df4);

/// The characteristic UUIDs requested during discovery.
pub const VEHICLE_CHARACTERISTIC_UUIDS: [Uuid; 2] = [VEHICLE_READ_UUID, VEHICLE_WRITE_UUID];

/// What a characteristic is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacteristicRole {
    Write,
    Notify,
}

impl CharacteristicRole {
    /// Maps a characteristic UUID to its role, if it is one of ours.
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        if uuid == VEHICLE_WRITE_UUID {
            Some(Self::Write)
        } else if uuid == VEHICLE_READ_UUID {
            Some(Self::Notify)
        } else {
            None
        }
    }
}

/// Raised when discovery did not return both required characteristics.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("vehicle characteristic missing: {0:?}")]
pub struct MissingCharacteristic(pub CharacteristicRole);

/// The write and notify handles of one connected vehicle.
#[derive(Debug, Clone)]
pub struct CharacteristicPair<C> {
    pub write: C,
    pub notify: C,
}

impl<C> CharacteristicPair<C> {
    /// Assigns discovered characteristics to roles by UUID.
    ///
    /// Unknown UUIDs are ignored; if a role appears twice the first one wins.
    ///
    /// # Errors
    ///
    /// Returns [`MissingCharacteristic`] naming the first role that has no
    /// matching characteristic.
    pub fn assign<F>(discovered: Vec<C>, uuid_of: F) -> Result<Self, MissingCharacteristic>
    where
        F: Fn(&C) -> Uuid,
    {
        let mut write = None;
        let mut notify = None;

        for characteristic in discovered {
            match CharacteristicRole::from_uuid(uuid_of(&characteristic)) {
                Some(CharacteristicRole::Write) if write.is_none() => write = Some(characteristic),
                Some(CharacteristicRole::Notify) if notify.is_none() => {
                    notify = Some(characteristic)
                }
                _ => {}
            }
        }

        Ok(Self {
            write: write.ok_or(MissingCharacteristic(CharacteristicRole::Write))?,
            notify: notify.ok_or(MissingCharacteristic(CharacteristicRole::Notify))?,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
