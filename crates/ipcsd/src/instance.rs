// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ipcsd contributors

//! Service instance identification and wildcard matching.
//!
//! A service instance is identified by the 4-tuple `(service_id, instance_id,
//! major_version, minor_version)`. Two refined forms exist:
//!
//! - [`ProvidedInstance`]: concrete, wildcard-free. Used when offering.
//! - [`RequiredInstance`]: may use [`INSTANCE_ID_ALL`] and
//!   [`MINOR_VERSION_ANY`]. Used when subscribing.
//!
//! A required instance R matches a provided instance P iff the service ids
//! and major versions are equal, the instance id is equal or `R` uses
//! [`INSTANCE_ID_ALL`], and `P`'s minor version is at least `R`'s or `R` uses
//! [`MINOR_VERSION_ANY`].

use std::fmt;

/// Wildcard instance id matching every instance of a service.
pub const INSTANCE_ID_ALL: u32 = u32::MAX;

/// Wildcard minor version matching every minor version.
pub const MINOR_VERSION_ANY: u32 = u32::MAX;

/// Raw identifier tuple shared by both refined forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceInstanceId {
    pub service_id: u32,
    pub instance_id: u32,
    pub major_version: u32,
    pub minor_version: u32,
}

impl ServiceInstanceId {
    pub const fn new(
        service_id: u32,
        instance_id: u32,
        major_version: u32,
        minor_version: u32,
    ) -> Self {
        Self {
            service_id,
            instance_id,
            major_version,
            minor_version,
        }
    }

    /// True if any field carries a wildcard value.
    pub const fn has_wildcards(&self) -> bool {
        self.instance_id == INSTANCE_ID_ALL || self.minor_version == MINOR_VERSION_ANY
    }
}

impl fmt::Display for ServiceInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[ServiceId: {}, InstanceId: {}, MajorVersion: {}, MinorVersion: {}]",
            self.service_id, self.instance_id, self.major_version, self.minor_version
        )
    }
}

/// The single matching rule, shared by both refined forms.
///
/// Branch-simple and allocation-free; called once per registry entry during
/// wildcard lookups.
#[inline]
fn is_matching(required: &ServiceInstanceId, provided: &ServiceInstanceId) -> bool {
    (required.service_id == provided.service_id)
        && (required.major_version == provided.major_version)
        && ((required.instance_id == INSTANCE_ID_ALL)
            || (required.instance_id == provided.instance_id))
        && ((required.minor_version == MINOR_VERSION_ANY)
            || (provided.minor_version >= required.minor_version))
}

/// Concrete identifier of an offered service instance. Never contains
/// wildcards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProvidedInstance(ServiceInstanceId);

impl ProvidedInstance {
    /// Construct a provided instance identifier.
    ///
    /// # Panics
    ///
    /// Panics if any field carries a wildcard value. Offering a wildcard
    /// identifier is a precondition violation of the caller.
    pub fn new(service_id: u32, instance_id: u32, major_version: u32, minor_version: u32) -> Self {
        let id = ServiceInstanceId::new(service_id, instance_id, major_version, minor_version);
        assert!(
            !id.has_wildcards(),
            "wildcards are not allowed for a provided service instance identifier"
        );
        Self(id)
    }

    /// Fallible construction for decode paths where wildcard fields mean a
    /// corrupted message rather than a caller bug.
    pub fn try_new(id: ServiceInstanceId) -> Option<Self> {
        if id.has_wildcards() {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn id(&self) -> &ServiceInstanceId {
        &self.0
    }

    pub fn is_matching(&self, required: &RequiredInstance) -> bool {
        is_matching(&required.0, &self.0)
    }

    /// View this concrete identifier as a (wildcard-free) required form.
    pub fn to_required(self) -> RequiredInstance {
        RequiredInstance(self.0)
    }
}

impl fmt::Display for ProvidedInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProvidedServiceInstance{}", self.0)
    }
}

/// Possibly-wildcarded identifier used to subscribe to service instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequiredInstance(ServiceInstanceId);

impl RequiredInstance {
    pub const fn new(
        service_id: u32,
        instance_id: u32,
        major_version: u32,
        minor_version: u32,
    ) -> Self {
        Self(ServiceInstanceId::new(
            service_id,
            instance_id,
            major_version,
            minor_version,
        ))
    }

    pub fn id(&self) -> &ServiceInstanceId {
        &self.0
    }

    pub fn is_matching(&self, provided: &ProvidedInstance) -> bool {
        is_matching(&self.0, &provided.0)
    }
}

impl From<ServiceInstanceId> for RequiredInstance {
    fn from(id: ServiceInstanceId) -> Self {
        Self(id)
    }
}

impl fmt::Display for RequiredInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequiredServiceInstance{}", self.0)
    }
}

/// Query seam for registries: `K: Matchable<Q>` means a registry keyed by `K`
/// can be searched with a query of type `Q`.
pub trait Matchable<Q> {
    fn is_matching(&self, query: &Q) -> bool;
}

impl Matchable<RequiredInstance> for ProvidedInstance {
    fn is_matching(&self, query: &RequiredInstance) -> bool {
        ProvidedInstance::is_matching(self, query)
    }
}

impl Matchable<ProvidedInstance> for RequiredInstance {
    fn is_matching(&self, query: &ProvidedInstance) -> bool {
        RequiredInstance::is_matching(self, query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provided(s: u32, i: u32, maj: u32, min: u32) -> ProvidedInstance {
        ProvidedInstance::new(s, i, maj, min)
    }

    fn required(s: u32, i: u32, maj: u32, min: u32) -> RequiredInstance {
        RequiredInstance::new(s, i, maj, min)
    }

    #[test]
    fn test_exact_match() {
        let r = required(42, 7, 1, 0);
        let p = provided(42, 7, 1, 0);
        assert!(r.is_matching(&p));
        assert!(p.is_matching(&r));
    }

    #[test]
    fn test_service_id_mismatch() {
        assert!(!required(42, 7, 1, 0).is_matching(&provided(43, 7, 1, 0)));
    }

    #[test]
    fn test_major_version_must_be_equal() {
        assert!(!required(42, 7, 1, 0).is_matching(&provided(42, 7, 2, 0)));
        assert!(!required(42, 7, 2, 0).is_matching(&provided(42, 7, 1, 0)));
    }

    #[test]
    fn test_instance_wildcard_matches_every_instance() {
        let r = required(42, INSTANCE_ID_ALL, 1, 0);
        assert!(r.is_matching(&provided(42, 1, 1, 0)));
        assert!(r.is_matching(&provided(42, 2, 1, 5)));
        assert!(!r.is_matching(&provided(43, 1, 1, 0)));
    }

    #[test]
    fn test_minor_version_is_a_lower_bound() {
        let r = required(42, 7, 1, 5);
        assert!(!r.is_matching(&provided(42, 7, 1, 3)));
        assert!(r.is_matching(&provided(42, 7, 1, 5)));
        assert!(r.is_matching(&provided(42, 7, 1, 9)));
    }

    #[test]
    fn test_minor_wildcard_matches_every_minor() {
        let r = required(42, 7, 1, MINOR_VERSION_ANY);
        assert!(r.is_matching(&provided(42, 7, 1, 0)));
        assert!(r.is_matching(&provided(42, 7, 1, 1234)));
    }

    #[test]
    fn test_both_wildcards() {
        let r = required(42, INSTANCE_ID_ALL, 1, MINOR_VERSION_ANY);
        assert!(r.is_matching(&provided(42, 9, 1, 0)));
        assert!(!r.is_matching(&provided(42, 9, 2, 0)));
    }

    #[test]
    #[should_panic(expected = "wildcards are not allowed")]
    fn test_provided_rejects_instance_wildcard() {
        let _ = provided(42, INSTANCE_ID_ALL, 1, 0);
    }

    #[test]
    #[should_panic(expected = "wildcards are not allowed")]
    fn test_provided_rejects_minor_wildcard() {
        let _ = provided(42, 7, 1, MINOR_VERSION_ANY);
    }

    #[test]
    fn test_try_new_on_wildcards() {
        let id = ServiceInstanceId::new(42, INSTANCE_ID_ALL, 1, 0);
        assert!(ProvidedInstance::try_new(id).is_none());
        let id = ServiceInstanceId::new(42, 7, 1, 0);
        assert_eq!(
            ProvidedInstance::try_new(id),
            Some(ProvidedInstance::new(42, 7, 1, 0))
        );
    }

    #[test]
    fn test_to_required_round_trip() {
        let p = provided(42, 7, 1, 3);
        let r = p.to_required();
        assert!(r.is_matching(&p));
        assert_eq!(r.id(), p.id());
    }

    #[test]
    fn test_display() {
        let p = provided(1, 2, 3, 4);
        let text = p.to_string();
        assert!(text.contains("ServiceId: 1"));
        assert!(text.contains("MinorVersion: 4"));
    }
}
