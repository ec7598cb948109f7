// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The comma-separated port-map encoding used by the per-fabric metadata keys.
//!
//! A map is a flat token list grouped in triples, each being the physical port
//! WWPN followed by the two virtual port WWPNs:
//! `"p1,v1a,v1b,p2,v2a,v2b,..."`. The empty string is the empty map.

use npiv_types::{PortMapping, VirtualPortPair, Wwpn, WwpnParseError};
use thiserror::Error;

const TOKENS_PER_MAPPING: usize = 3;

/// A stored record that cannot be interpreted. Never repaired silently.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("port map has {0} tokens, not a multiple of 3")]
    TokenCount(usize),

    #[error("port map has an empty token at position {0}")]
    EmptyToken(usize),

    #[error("port map holds an invalid WWPN")]
    Wwpn(#[from] WwpnParseError),

    #[error("unknown fabric state {0:?}")]
    UnknownState(String),

    #[error("could not deserialize fabric record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("kind/version of fabric record not expected: {0} v{1}")]
    UnexpectedPayload(String, u32),
}

pub fn encode_legacy(map: &[PortMapping]) -> String {
    let mut tokens = Vec::with_capacity(map.len() * TOKENS_PER_MAPPING);
    for m in map {
        tokens.push(m.physical.to_string());
        tokens.push(m.virtual_ports.first.to_string());
        tokens.push(m.virtual_ports.second.to_string());
    }
    tokens.join(",")
}

pub fn decode_legacy(value: &str) -> Result<Vec<PortMapping>, DecodeError> {
    if value.is_empty() {
        return Ok(Vec::new());
    }

    let tokens: Vec<&str> = value.split(',').collect();
    if tokens.len() % TOKENS_PER_MAPPING != 0 {
        return Err(DecodeError::TokenCount(tokens.len()));
    }

    let wwpns = tokens
        .iter()
        .enumerate()
        .map(|(pos, tok)| {
            let tok = tok.trim();
            if tok.is_empty() {
                return Err(DecodeError::EmptyToken(pos));
            }
            Ok(tok.parse::<Wwpn>()?)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(wwpns
        .chunks_exact(TOKENS_PER_MAPPING)
        .map(|t| PortMapping::new(t[0], VirtualPortPair::new(t[1], t[2])))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn decodes_triples_in_order() {
        let map = decode_legacy(
            "10000090FA1B2C3D,C05076065A8B0010,C05076065A8B0011,\
            10000090FA1B2C3E,C05076065A8B0012,C05076065A8B0013",
        )
        .unwrap();

        assert_eq!(map.len(), 2);
        assert_eq!(map[0].physical.to_string(), "10000090FA1B2C3D");
        assert_eq!(
            map[0].virtual_ports.to_string(),
            "C05076065A8B0010 C05076065A8B0011"
        );
        assert_eq!(map[1].physical.to_string(), "10000090FA1B2C3E");
        assert_eq!(map[1].virtual_ports.second.to_string(), "C05076065A8B0013");
    }

    #[test]
    fn malformed_maps_are_errors() {
        assert!(matches!(
            decode_legacy("10000090FA1B2C3D,C05076065A8B0010"),
            Err(DecodeError::TokenCount(2))
        ));
        assert!(matches!(
            decode_legacy("10000090FA1B2C3D,,C05076065A8B0010"),
            Err(DecodeError::EmptyToken(1))
        ));
        assert!(matches!(
            decode_legacy("10000090FA1B2C3D,C05076065A8B0010,bogus"),
            Err(DecodeError::Wwpn(_))
        ));
    }

    #[test]
    fn empty_map_is_empty_string() {
        assert_eq!(encode_legacy(&[]), "");
        assert!(decode_legacy("").unwrap().is_empty());
    }

    fn mapping() -> impl Strategy<Value = PortMapping> {
        (any::<u64>(), any::<u64>(), any::<u64>()).prop_map(|(p, a, b)| {
            PortMapping::new(
                Wwpn::from_u64(p),
                VirtualPortPair::new(Wwpn::from_u64(a), Wwpn::from_u64(b)),
            )
        })
    }

    proptest! {
        #[test]
        fn legacy_encoding_round_trips(
            map in proptest::collection::vec(mapping(), 0..16)
        ) {
            let encoded = encode_legacy(&map);
            if !map.is_empty() {
                prop_assert_eq!(encoded.split(',').count(), map.len() * 3);
            }
            prop_assert_eq!(decode_legacy(&encoded).unwrap(), map);
        }
    }
}
