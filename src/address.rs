//! Bluetooth device addressing.
//!
//! A 48-bit Bluetooth MAC address, displayed and parsed as six
//! colon-separated uppercase hex octets (`11:22:33:44:55:66`).

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::error::BesRefError;

/// A 48-bit Bluetooth device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BtAddress(pub [u8; 6]);

impl BtAddress {
   /// Returns the raw octets, most significant first.
   pub const fn octets(self) -> [u8; 6] {
      self.0
   }

   /// Compact uppercase form without separators (`112233445566`), as the
   /// board's `connect` command expects.
   pub fn compact(self) -> String {
      hex::encode_upper(self.0)
   }

   /// Address with the last octet decremented by one, used to derive a
   /// secondary earbud address from the primary's. `None` when the last
   /// octet is already `0x00`.
   pub fn predecessor(self) -> Option<Self> {
      let mut octets = self.0;
      octets[5] = octets[5].checked_sub(1)?;
      Some(Self(octets))
   }
}

impl fmt::Display for BtAddress {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let [a, b, c, d, e, g] = self.0;
      write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
   }
}

impl FromStr for BtAddress {
   type Err = BesRefError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      let invalid = || BesRefError::InvalidAddress(s.to_string());
      let mut octets = [0u8; 6];
      let mut parts = s.split(':');
      for octet in &mut octets {
         let part = parts.next().ok_or_else(invalid)?;
         if part.len() != 2 {
            return Err(invalid());
         }
         *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
      }
      if parts.next().is_some() {
         return Err(invalid());
      }
      Ok(Self(octets))
   }
}

impl Serialize for BtAddress {
   fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
      serializer.collect_str(self)
   }
}

impl<'de> Deserialize<'de> for BtAddress {
   fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
      let s = String::deserialize(deserializer)?;
      s.parse().map_err(de::Error::custom)
   }
}
