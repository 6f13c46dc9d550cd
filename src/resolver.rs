// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Type Resolver
//!
//! Each registry entry carries a monomorphised decode function for its
//! declared payload type. Resolving an entry means running that function over
//! the raw body; a decode error is an ordinary miss, not a fault, so it is
//! neither logged nor surfaced here.

use crate::registry::DispatcherEntry;
use serde::de::DeserializeOwned;
use std::any::Any;

/// A freshly decoded payload whose concrete type is known only to the entry that produced it.
pub(crate) type DecodedPayload = Box<dyn Any + Send + Sync>;

/// Decodes a raw body into the payload type an entry was registered with.
pub(crate) type DecodeFn = fn(&[u8]) -> Option<DecodedPayload>;

pub(crate) fn decode_json<T>(raw: &[u8]) -> Option<DecodedPayload>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    serde_json::from_slice::<T>(raw)
        .ok()
        .map(|msg| Box::new(msg) as DecodedPayload)
}

/// Attempts to decode `raw` into the entry's declared type.
pub(crate) fn try_resolve(entry: &DispatcherEntry, raw: &[u8]) -> Option<DecodedPayload> {
    (entry.decode)(raw)
}
