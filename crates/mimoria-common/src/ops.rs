//! Stable numeric operation codes for the client and cluster wire protocols
//! (§6 EXTERNAL INTERFACES).

use crate::WireError;

macro_rules! opcode_enum {
    ($name:ident { $($variant:ident = $value:expr),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            pub fn from_byte(b: u8) -> Result<Self, WireError> {
                match b {
                    $($value => Ok($name::$variant),)+
                    other => Err(WireError::UnknownOp(other)),
                }
            }

            pub fn as_byte(self) -> u8 {
                self as u8
            }
        }
    };
}

opcode_enum!(ClientOp {
    Login = 0,
    GetString = 1,
    SetString = 2,
    GetList = 3,
    AddList = 4,
    RemoveList = 5,
    ContainsList = 6,
    Exists = 7,
    Delete = 8,
    GetObjectBinary = 9,
    SetObjectBinary = 10,
    GetStats = 11,
    GetBytes = 12,
    SetBytes = 13,
    SetCounter = 14,
    IncrementCounter = 15,
    Bulk = 16,
    GetMapValue = 17,
    SetMapValue = 18,
    GetMap = 19,
    SetMap = 20,
    Subscribe = 21,
    Unsubscribe = 22,
    Publish = 23,
});

/// Operation codes inside a `Bulk` envelope permitted by the spec's §9
/// resolution: only this subset is handled, everything else is rejected.
pub fn bulk_op_is_supported(op: ClientOp) -> bool {
    matches!(
        op,
        ClientOp::GetString | ClientOp::SetString | ClientOp::Exists | ClientOp::Delete
    )
}

opcode_enum!(ClusterOp {
    Handshake = 0,
    Alive = 1,
    Election = 2,
    Victory = 3,
    Sync = 4,
    ReplicateOne = 5,
    ReplicateBatch = 6,
});

/// Response status byte, carried immediately after the request id (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    Error = 1,
}

impl Status {
    pub fn from_byte(b: u8) -> Result<Self, WireError> {
        match b {
            0 => Ok(Status::Ok),
            1 => Ok(Status::Error),
            other => Err(WireError::UnknownOp(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_op_round_trips_through_byte() {
        for op in [ClientOp::Login, ClientOp::Bulk, ClientOp::Publish] {
            assert_eq!(ClientOp::from_byte(op.as_byte()).unwrap(), op);
        }
    }

    #[test]
    fn unknown_client_op_byte_is_rejected() {
        assert!(ClientOp::from_byte(0xFE).is_err());
    }

    #[test]
    fn bulk_subset_matches_spec_resolution() {
        assert!(bulk_op_is_supported(ClientOp::GetString));
        assert!(bulk_op_is_supported(ClientOp::SetString));
        assert!(bulk_op_is_supported(ClientOp::Exists));
        assert!(bulk_op_is_supported(ClientOp::Delete));
        assert!(!bulk_op_is_supported(ClientOp::IncrementCounter));
        assert!(!bulk_op_is_supported(ClientOp::Subscribe));
    }
}
