//! Class hierarchy model.
//!
//! The resolver never loads classes itself. The host supplies a
//! [`ClassHierarchy`] that answers "what does class X look like" for every
//! class reachable from the instrumented one; [`ClassInfo`] is the answer.
//!
//! ## Lookups
//!
//! - [`find_field`]: breadth-first search through a class, its interfaces and
//!   superclasses, visiting each type once
//! - [`is_subclass_of`]: superclass chain walk
//! - [`nest_host`]: explicit `NestHost` or the outermost enclosing class

use anyhow::Result;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use probe_agent_types::{package_of, simple_name_of, JavaType, OBJECT_INTERNAL_NAME};
use probe_classfile::{access, ClassFile};

/// Identity of the class loader that defined a class. Runtime packages are
/// scoped by loader.
pub type LoaderId = u32;

/// Loader used when the host does not distinguish loaders.
pub const APP_LOADER: LoaderId = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMember {
    pub name: String,
    pub descriptor: String,
    pub access_flags: u16,
}

impl FieldMember {
    pub fn new(name: impl Into<String>, descriptor: impl Into<String>, access_flags: u16) -> Self {
        Self {
            name: name.into(),
            descriptor: descriptor.into(),
            access_flags,
        }
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & access::STATIC != 0
    }

    pub fn is_public(&self) -> bool {
        self.access_flags & access::PUBLIC != 0
    }

    pub fn is_private(&self) -> bool {
        self.access_flags & access::PRIVATE != 0
    }

    pub fn is_protected(&self) -> bool {
        self.access_flags & access::PROTECTED != 0
    }

    pub fn field_type(&self) -> Option<JavaType> {
        JavaType::parse(&self.descriptor).ok()
    }

    /// Access keyword for diagnostics.
    pub fn access_keyword(&self) -> &'static str {
        if self.is_public() {
            "public"
        } else if self.is_private() {
            "private"
        } else if self.is_protected() {
            "protected"
        } else {
            "package-private"
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleExport {
    /// Package in internal form (`com/x/api`)
    pub package: String,
    /// Friend modules for a qualified export; empty for an unqualified one
    pub to: Vec<String>,
}

/// The module a class belongs to. The unnamed module exports everything.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModuleDescriptor {
    pub name: Option<String>,
    pub exports: Vec<ModuleExport>,
}

impl ModuleDescriptor {
    pub fn unnamed() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            exports: Vec::new(),
        }
    }

    pub fn exporting(mut self, package: impl Into<String>) -> Self {
        self.exports.push(ModuleExport {
            package: package.into(),
            to: Vec::new(),
        });
        self
    }

    pub fn exporting_to(mut self, package: impl Into<String>, module: impl Into<String>) -> Self {
        let package = package.into();
        let module = module.into();
        match self.exports.iter_mut().find(|e| e.package == package) {
            Some(export) if !export.to.is_empty() => export.to.push(module),
            Some(_) => {}
            None => self.exports.push(ModuleExport {
                package,
                to: vec![module],
            }),
        }
        self
    }

    pub fn is_named(&self) -> bool {
        self.name.is_some()
    }

    /// Whether `package` is visible to code in module `to`.
    pub fn exports_package(&self, package: &str, to: &ModuleDescriptor) -> bool {
        if !self.is_named() {
            return true;
        }
        self.exports.iter().any(|export| {
            export.package == package
                && (export.to.is_empty()
                    || to
                        .name
                        .as_ref()
                        .is_some_and(|name| export.to.iter().any(|t| t == name)))
        })
    }
}

/// Everything the resolver and accessibility rules need about one class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    /// Internal name (`com/x/Foo`)
    pub name: String,
    pub access_flags: u16,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub fields: Vec<FieldMember>,
    /// Directly enclosing class for nested, local and anonymous classes
    pub enclosing_class: Option<String>,
    /// Explicit nest host, when the class file declares one
    pub nest_host: Option<String>,
    pub module: Arc<ModuleDescriptor>,
    pub loader: LoaderId,
}

impl ClassInfo {
    /// A public class extending `java/lang/Object` in the unnamed module.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let super_name = (name != OBJECT_INTERNAL_NAME).then(|| OBJECT_INTERNAL_NAME.to_string());
        Self {
            name,
            access_flags: access::PUBLIC | access::SUPER,
            super_name,
            interfaces: Vec::new(),
            fields: Vec::new(),
            enclosing_class: None,
            nest_host: None,
            module: Arc::new(ModuleDescriptor::unnamed()),
            loader: APP_LOADER,
        }
    }

    pub fn with_access(mut self, access_flags: u16) -> Self {
        self.access_flags = access_flags;
        self
    }

    pub fn with_super(mut self, super_name: impl Into<String>) -> Self {
        self.super_name = Some(super_name.into());
        self
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    pub fn with_field(
        mut self,
        name: impl Into<String>,
        descriptor: impl Into<String>,
        access_flags: u16,
    ) -> Self {
        self.fields.push(FieldMember::new(name, descriptor, access_flags));
        self
    }

    pub fn enclosed_in(mut self, enclosing: impl Into<String>) -> Self {
        self.enclosing_class = Some(enclosing.into());
        self
    }

    pub fn with_nest_host(mut self, host: impl Into<String>) -> Self {
        self.nest_host = Some(host.into());
        self
    }

    pub fn in_module(mut self, module: Arc<ModuleDescriptor>) -> Self {
        self.module = module;
        self
    }

    pub fn with_loader(mut self, loader: LoaderId) -> Self {
        self.loader = loader;
        self
    }

    pub fn package(&self) -> &str {
        package_of(&self.name)
    }

    pub fn simple_name(&self) -> &str {
        simple_name_of(&self.name)
    }

    pub fn is_public(&self) -> bool {
        self.access_flags & access::PUBLIC != 0
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & access::INTERFACE != 0
    }

    pub fn declared_field(&self, name: &str) -> Option<&FieldMember> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Same runtime package: same defining loader and same package name.
    pub fn same_runtime_package(&self, other: &ClassInfo) -> bool {
        self.loader == other.loader && self.package() == other.package()
    }

    /// Build from a parsed class file. Module and loader are not recorded in
    /// class files; they default to the unnamed module and [`APP_LOADER`].
    pub fn from_class_file(class: &ClassFile) -> Result<Self> {
        let pool = &class.constant_pool;
        let fields = class
            .fields
            .iter()
            .map(|f| {
                Ok(FieldMember::new(
                    f.name(pool)?,
                    f.descriptor(pool)?,
                    f.access_flags,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name: class.this_class_name()?.to_string(),
            access_flags: class.access_flags,
            super_name: class.super_class_name()?.map(str::to_string),
            interfaces: class
                .interface_names()?
                .into_iter()
                .map(str::to_string)
                .collect(),
            fields,
            enclosing_class: class.enclosing_class_name()?.map(str::to_string),
            nest_host: class.nest_host_name()?.map(str::to_string),
            module: Arc::new(ModuleDescriptor::unnamed()),
            loader: APP_LOADER,
        })
    }
}

// =============================================================================
// Hierarchy Sources
// =============================================================================

/// Read access to class metadata, supplied by the host runtime.
pub trait ClassHierarchy: Send + Sync {
    fn class_info(&self, name: &str) -> Option<Arc<ClassInfo>>;
}

/// A fixed set of classes, keyed by internal name.
#[derive(Debug, Clone, Default)]
pub struct InMemoryHierarchy {
    classes: HashMap<String, Arc<ClassInfo>>,
}

impl InMemoryHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, info: ClassInfo) {
        self.classes.insert(info.name.clone(), Arc::new(info));
    }

    pub fn with(mut self, info: ClassInfo) -> Self {
        self.insert(info);
        self
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl ClassHierarchy for InMemoryHierarchy {
    fn class_info(&self, name: &str) -> Option<Arc<ClassInfo>> {
        self.classes.get(name).cloned()
    }
}

/// Host hierarchy with one extra class used when the host does not know it,
/// typically the class being transformed, which is not loaded yet.
pub struct OverlayHierarchy<'a> {
    base: &'a dyn ClassHierarchy,
    overlay: Arc<ClassInfo>,
}

impl<'a> OverlayHierarchy<'a> {
    pub fn new(base: &'a dyn ClassHierarchy, overlay: ClassInfo) -> Self {
        Self {
            base,
            overlay: Arc::new(overlay),
        }
    }
}

impl ClassHierarchy for OverlayHierarchy<'_> {
    fn class_info(&self, name: &str) -> Option<Arc<ClassInfo>> {
        self.base
            .class_info(name)
            .or_else(|| (self.overlay.name == name).then(|| self.overlay.clone()))
    }
}

// =============================================================================
// Lookups
// =============================================================================

/// Find field `name` on `start` or any of its supertypes. Each class is
/// visited at most once, so diamonds and cycles terminate. Returns the
/// declaring class and the field.
pub fn find_field(
    hierarchy: &dyn ClassHierarchy,
    start: &str,
    name: &str,
) -> Option<(Arc<ClassInfo>, FieldMember)> {
    let mut queue = VecDeque::from([start.to_string()]);
    let mut visited = HashSet::new();

    while let Some(class_name) = queue.pop_front() {
        if !visited.insert(class_name.clone()) {
            continue;
        }
        let Some(info) = hierarchy.class_info(&class_name) else {
            continue;
        };
        if let Some(field) = info.declared_field(name) {
            return Some((info.clone(), field.clone()));
        }
        queue.extend(info.interfaces.iter().cloned());
        if let Some(super_name) = &info.super_name {
            queue.push_back(super_name.clone());
        }
    }
    None
}

/// Whether `query` is `of` or extends it through the superclass chain.
pub fn is_subclass_of(hierarchy: &dyn ClassHierarchy, query: &str, of: &str) -> bool {
    let mut current = Some(query.to_string());
    let mut visited = HashSet::new();
    while let Some(name) = current {
        if name == of {
            return true;
        }
        if !visited.insert(name.clone()) {
            return false;
        }
        current = hierarchy
            .class_info(&name)
            .and_then(|info| info.super_name.clone());
    }
    false
}

/// Whether a value of class `from` can be passed where `to` is expected:
/// `to` is `from` itself, `java/lang/Object`, or any superclass or
/// superinterface of `from`.
pub fn is_assignable_to(hierarchy: &dyn ClassHierarchy, from: &str, to: &str) -> bool {
    if from == to || to == OBJECT_INTERNAL_NAME {
        return true;
    }
    let mut queue = VecDeque::from([from.to_string()]);
    let mut visited = HashSet::new();
    while let Some(name) = queue.pop_front() {
        if name == to {
            return true;
        }
        if !visited.insert(name.clone()) {
            continue;
        }
        if let Some(info) = hierarchy.class_info(&name) {
            queue.extend(info.interfaces.iter().cloned());
            queue.extend(info.super_name.iter().cloned());
        }
    }
    false
}

/// Classes enclosing `class_name`, innermost first.
pub fn enclosing_classes(hierarchy: &dyn ClassHierarchy, class_name: &str) -> Vec<String> {
    let mut chain = Vec::new();
    let mut current = hierarchy
        .class_info(class_name)
        .and_then(|info| info.enclosing_class.clone());
    while let Some(name) = current {
        if name == class_name || chain.contains(&name) {
            break;
        }
        current = hierarchy
            .class_info(&name)
            .and_then(|info| info.enclosing_class.clone());
        chain.push(name);
    }
    chain
}

/// Nest host of a class: the declared `NestHost`, else the outermost enclosing
/// class, else the class itself.
pub fn nest_host(hierarchy: &dyn ClassHierarchy, info: &ClassInfo) -> String {
    if let Some(host) = &info.nest_host {
        return host.clone();
    }
    enclosing_classes(hierarchy, &info.name)
        .pop()
        .unwrap_or_else(|| info.name.clone())
}

pub fn are_nestmates(hierarchy: &dyn ClassHierarchy, a: &ClassInfo, b: &ClassInfo) -> bool {
    a.name == b.name || nest_host(hierarchy, a) == nest_host(hierarchy, b)
}
