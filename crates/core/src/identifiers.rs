//! Opaque identifier types.
//!
//! The server is the source of truth for every one of these identifiers; the
//! client never parses them apart, so they are modelled as unsized string
//! wrappers with boxed owned forms rather than validated structures.

use rand::Rng as _;
use ulid::Ulid;

macro_rules! partial_eq_string {
    ($id:ty) => {
        partial_eq_string!(@imp $id, str);
        partial_eq_string!(@imp $id, &str);
        partial_eq_string!(@imp $id, String);
        partial_eq_string!(@imp str, $id);
        partial_eq_string!(@imp &str, $id);
        partial_eq_string!(@imp String, $id);
    };
    (@imp $l:ty, $r:ty) => {
        impl PartialEq<$r> for $l {
            fn eq(&self, other: &$r) -> bool {
                AsRef::<str>::as_ref(self) == AsRef::<str>::as_ref(other)
            }
        }
    };
}

macro_rules! opaque_identifier {
    ($(#[$meta:meta])* $id:ident) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $id(str);

        impl $id {
            pub(crate) fn from_borrowed(s: &str) -> &Self {
                unsafe { std::mem::transmute(s) }
            }

            pub(crate) fn from_owned(s: Box<str>) -> Box<Self> {
                unsafe { Box::from_raw(Box::into_raw(s) as _) }
            }

            fn into_owned(self: Box<Self>) -> Box<str> {
                unsafe { Box::from_raw(Box::into_raw(self) as _) }
            }

            /// Creates a string slice from this identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Clone for Box<$id> {
            fn clone(&self) -> Self {
                (**self).to_owned()
            }
        }

        impl ToOwned for $id {
            type Owned = Box<$id>;

            fn to_owned(&self) -> Self::Owned {
                Self::from_owned(self.0.into())
            }
        }

        impl AsRef<str> for $id {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl AsRef<str> for Box<$id> {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl std::fmt::Debug for $id {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                <str as std::fmt::Debug>::fmt(self.as_str(), f)
            }
        }

        impl std::fmt::Display for $id {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }

        impl serde::Serialize for $id {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> serde::Deserialize<'de> for Box<$id> {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                Box::<str>::deserialize(deserializer).map($id::from_owned)
            }
        }

        impl<'a> From<&'a str> for &'a $id {
            fn from(s: &'a str) -> Self {
                $id::from_borrowed(s)
            }
        }

        impl From<&str> for Box<$id> {
            fn from(s: &str) -> Self {
                $id::from_owned(s.into())
            }
        }

        impl From<String> for Box<$id> {
            fn from(s: String) -> Self {
                $id::from_owned(s.into())
            }
        }

        impl From<&$id> for Box<$id> {
            fn from(id: &$id) -> Self {
                id.to_owned()
            }
        }

        impl From<Box<$id>> for String {
            fn from(id: Box<$id>) -> Self {
                id.into_owned().into()
            }
        }

        impl PartialEq<Box<$id>> for $id {
            fn eq(&self, other: &Box<$id>) -> bool {
                self.as_str() == other.as_str()
            }
        }

        impl PartialEq<$id> for Box<$id> {
            fn eq(&self, other: &$id) -> bool {
                self.as_str() == other.as_str()
            }
        }

        partial_eq_string!($id);
        partial_eq_string!(Box<$id>);
    };
}

opaque_identifier! {
    /// A Matrix room ID.
    RoomId
}

/// An owned [`RoomId`].
pub type OwnedRoomId = Box<RoomId>;

opaque_identifier! {
    /// A Matrix user ID.
    UserId
}

/// An owned [`UserId`].
pub type OwnedUserId = Box<UserId>;

opaque_identifier! {
    /// A Matrix device ID.
    ///
    /// Device identifiers are completely opaque character sequences. This type
    /// is provided simply for its semantic value.
    DeviceId
}

/// An owned [`DeviceId`].
pub type OwnedDeviceId = Box<DeviceId>;

opaque_identifier! {
    /// A Matrix transaction ID.
    ///
    /// Transaction IDs are opaque strings sent to the server so that retried
    /// requests can be deduplicated.
    TransactionId
}

/// An owned [`TransactionId`].
pub type OwnedTransactionId = Box<TransactionId>;

impl DeviceId {
    /// Generates a random `DeviceId`, suitable for assignment to a new device.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> OwnedDeviceId {
        Self::from_borrowed(&generate_localpart(10)).to_owned()
    }
}

impl TransactionId {
    /// Creates a fresh transaction ID.
    ///
    /// No structure is guaranteed beyond uniqueness within this process.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> OwnedTransactionId {
        Self::from_borrowed(&Ulid::new().to_string()).to_owned()
    }
}

fn generate_localpart(length: usize) -> String {
    rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}
