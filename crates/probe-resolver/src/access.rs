//! Field accessibility as seen from the instrumented class.
//!
//! Injected bytecode runs with the access rights of the class it is injected
//! into, so a reference chain may only touch fields that class could read
//! itself. The checks follow JVMS 5.4.4 plus the JLS 6.6.2 restriction on
//! protected instance access.

use probe_classfile::access;

use crate::hierarchy::{are_nestmates, is_subclass_of, ClassHierarchy, ClassInfo, FieldMember};

pub struct AccessibilityVerifier<'h> {
    hierarchy: &'h dyn ClassHierarchy,
}

impl<'h> AccessibilityVerifier<'h> {
    pub fn new(hierarchy: &'h dyn ClassHierarchy) -> Self {
        Self { hierarchy }
    }

    /// Whether `current` may read `field`, declared in `declaring`, through a
    /// reference of static type `target`.
    pub fn is_accessible(
        &self,
        target: &ClassInfo,
        declaring: &ClassInfo,
        field: &FieldMember,
        current: &ClassInfo,
    ) -> bool {
        // Static members have no receiver, so the protected receiver rule
        // does not apply.
        let target = (!field.is_static()).then_some(target);
        self.verify_member_access(target, declaring, field.access_flags, current)
    }

    pub fn verify_member_access(
        &self,
        target: Option<&ClassInfo>,
        declaring: &ClassInfo,
        modifiers: u16,
        current: &ClassInfo,
    ) -> bool {
        if current.name == declaring.name {
            return true;
        }
        if !self.verify_module_access(declaring, current) {
            return false;
        }
        if !declaring.is_public() && !declaring.same_runtime_package(current) {
            return false;
        }
        if modifiers & access::PUBLIC != 0 {
            return true;
        }
        if modifiers & access::PRIVATE != 0 {
            return are_nestmates(self.hierarchy, declaring, current);
        }

        let same_package = declaring.same_runtime_package(current);
        if modifiers & access::PROTECTED != 0 {
            if !same_package && !is_subclass_of(self.hierarchy, &current.name, &declaring.name) {
                return false;
            }
        } else if !same_package {
            return false;
        }

        // JLS 6.6.2: outside the package, protected instance access needs a
        // receiver of the accessing class or one of its subclasses.
        if let Some(target) = target {
            if modifiers & access::PROTECTED != 0
                && target.name != current.name
                && !declaring.same_runtime_package(current)
            {
                return is_subclass_of(self.hierarchy, &target.name, &current.name);
            }
        }
        true
    }

    fn verify_module_access(&self, declaring: &ClassInfo, current: &ClassInfo) -> bool {
        if declaring.module == current.module {
            return true;
        }
        declaring
            .module
            .exports_package(declaring.package(), &current.module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::{InMemoryHierarchy, ModuleDescriptor};
    use std::sync::Arc;

    fn hierarchy() -> InMemoryHierarchy {
        InMemoryHierarchy::new()
            .with(
                ClassInfo::new("a/Base")
                    .with_field("prot", "I", access::PROTECTED)
                    .with_field("pkg", "I", 0)
                    .with_field("priv", "I", access::PRIVATE)
                    .with_field("pub", "I", access::PUBLIC)
                    .with_field("sprot", "I", access::PROTECTED | access::STATIC),
            )
            .with(ClassInfo::new("a/Neighbour"))
            .with(ClassInfo::new("a/Hidden").with_access(0).with_field("pub", "I", access::PUBLIC))
            .with(ClassInfo::new("b/Sub").with_super("a/Base"))
            .with(ClassInfo::new("b/SubSub").with_super("b/Sub"))
            .with(ClassInfo::new("b/Other").with_super("a/Base"))
            .with(ClassInfo::new("a/Base$Inner").enclosed_in("a/Base"))
    }

    fn check(h: &InMemoryHierarchy, target: &str, declaring: &str, field: &str, current: &str) -> bool {
        let target = h.class_info(target).unwrap();
        let declaring = h.class_info(declaring).unwrap();
        let current = h.class_info(current).unwrap();
        let field = declaring.declared_field(field).unwrap().clone();
        AccessibilityVerifier::new(h).is_accessible(&target, &declaring, &field, &current)
    }

    #[test]
    fn test_same_class_always_accessible() {
        let h = hierarchy();
        assert!(check(&h, "a/Base", "a/Base", "priv", "a/Base"));
    }

    #[test]
    fn test_package_private_and_private() {
        let h = hierarchy();
        assert!(check(&h, "a/Base", "a/Base", "pkg", "a/Neighbour"));
        assert!(!check(&h, "a/Base", "a/Base", "pkg", "b/Sub"));
        assert!(!check(&h, "a/Base", "a/Base", "priv", "a/Neighbour"));
        assert!(check(&h, "a/Base", "a/Base", "priv", "a/Base$Inner"));
    }

    #[test]
    fn test_non_public_class_hides_public_members() {
        let h = hierarchy();
        assert!(check(&h, "a/Hidden", "a/Hidden", "pub", "a/Neighbour"));
        assert!(!check(&h, "a/Hidden", "a/Hidden", "pub", "b/Sub"));
    }

    #[test]
    fn test_protected_receiver_rule() {
        let h = hierarchy();
        // Through its own type or a subclass: allowed.
        assert!(check(&h, "b/Sub", "a/Base", "prot", "b/Sub"));
        assert!(check(&h, "b/SubSub", "a/Base", "prot", "b/Sub"));
        // Through the declaring type or a sibling: rejected.
        assert!(!check(&h, "a/Base", "a/Base", "prot", "b/Sub"));
        assert!(!check(&h, "b/Other", "a/Base", "prot", "b/Sub"));
        // Same package ignores the receiver.
        assert!(check(&h, "b/Other", "a/Base", "prot", "a/Neighbour"));
        // Static protected members have no receiver.
        assert!(check(&h, "a/Base", "a/Base", "sprot", "b/Sub"));
        assert!(!check(&h, "a/Base", "a/Base", "prot", "b/SubSub"));
    }

    #[test]
    fn test_declared_nest_host_grants_private_access() {
        let mut h = hierarchy();
        h.insert(ClassInfo::new("a/Base$$Lambda").with_nest_host("a/Base"));
        h.insert(ClassInfo::new("a/Stray$$Lambda").with_nest_host("a/Neighbour"));
        assert!(check(&h, "a/Base", "a/Base", "priv", "a/Base$$Lambda"));
        assert!(!check(&h, "a/Base", "a/Base", "priv", "a/Stray$$Lambda"));
    }

    #[test]
    fn test_runtime_package_includes_loader() {
        let mut h = hierarchy();
        h.insert(ClassInfo::new("a/Foreign").with_loader(7));
        assert!(!check(&h, "a/Base", "a/Base", "pkg", "a/Foreign"));
    }

    #[test]
    fn test_module_exports() {
        let library = Arc::new(ModuleDescriptor::named("lib").exporting("lib/api"));
        let h = InMemoryHierarchy::new()
            .with(
                ClassInfo::new("lib/api/Open")
                    .in_module(library.clone())
                    .with_field("value", "I", access::PUBLIC),
            )
            .with(
                ClassInfo::new("lib/impl/Closed")
                    .in_module(library)
                    .with_field("value", "I", access::PUBLIC),
            )
            .with(ClassInfo::new("app/Main"));
        assert!(check(&h, "lib/api/Open", "lib/api/Open", "value", "app/Main"));
        assert!(!check(&h, "lib/impl/Closed", "lib/impl/Closed", "value", "app/Main"));
    }
}
