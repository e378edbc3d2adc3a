//! Field path expressions.
//!
//! An expression is a dot separated path evaluated in the context of the
//! instrumented class (the caller):
//!
//! ```text
//! count                  field on the caller or its supertypes
//! this.a.b               explicit receiver, then two hops
//! super.a                field looked up from the caller's superclass
//! Outer.this.a           field of an enclosing instance
//! outerField             field of an enclosing class, through this$N
//! Caller.CONSTANT        static field by simple class name
//! Sibling.CONSTANT       static field of a class in the caller's package
//! com.x.Other.CONSTANT   static field by qualified class name
//! ```

use std::sync::Arc;

use tracing::trace;

use probe_agent_types::{is_valid_identifier, simple_name_of, JavaType};

use crate::access::AccessibilityVerifier;
use crate::chain::{OuterLink, ReferenceChainElement, ResolvedReferenceChain};
use crate::error::ResolveError;
use crate::hierarchy::{are_nestmates, enclosing_classes, find_field, ClassHierarchy, ClassInfo, FieldMember};

const THIS: &str = "this";
const SUPER: &str = "super";

pub struct ReferenceChainResolver<'h> {
    hierarchy: &'h dyn ClassHierarchy,
    verifier: AccessibilityVerifier<'h>,
}

/// Token stream over one expression.
struct Cursor<'e> {
    expression: &'e str,
    tokens: Vec<&'e str>,
    pos: usize,
}

impl<'e> Cursor<'e> {
    fn next(&mut self) -> Option<&'e str> {
        let token = self.tokens.get(self.pos).copied();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, reason: impl Into<String>) -> ResolveError {
        ResolveError::resolution(self.expression, reason)
    }
}

impl<'h> ReferenceChainResolver<'h> {
    pub fn new(hierarchy: &'h dyn ClassHierarchy) -> Self {
        Self {
            hierarchy,
            verifier: AccessibilityVerifier::new(hierarchy),
        }
    }

    /// Resolve `expression` against `caller` (internal name). The returned
    /// chain is not normalized.
    pub fn resolve(&self, caller: &str, expression: &str) -> Result<ResolvedReferenceChain, ResolveError> {
        let expression = expression.trim();
        let mut cursor = Cursor {
            expression,
            tokens: expression.split('.').map(str::trim).collect(),
            pos: 0,
        };
        if cursor.tokens.iter().any(|t| t.is_empty()) {
            return Err(cursor.error("empty path segment"));
        }
        let caller = self.class(&cursor, caller)?;
        let mut chain = ResolvedReferenceChain::new(caller.name.clone());
        self.start(&mut cursor, &caller, &mut chain)?;
        trace!(expression, chain = %chain, "resolved reference chain");
        Ok(chain)
    }

    fn start(
        &self,
        cursor: &mut Cursor<'_>,
        caller: &Arc<ClassInfo>,
        chain: &mut ResolvedReferenceChain,
    ) -> Result<(), ResolveError> {
        let Some(token) = cursor.next() else {
            return Err(cursor.error("empty expression"));
        };
        match token {
            THIS => return self.after_this(cursor, caller, caller, chain),
            SUPER => return self.after_super(cursor, caller, caller, chain),
            _ => {}
        }

        if let Some((declaring, field)) = find_field(self.hierarchy, &caller.name, token) {
            return self.after_field(cursor, caller, caller, caller, declaring, field, false, chain);
        }

        let enclosing = enclosing_classes(self.hierarchy, &caller.name);
        for outer in &enclosing {
            if let Some((declaring, field)) = find_field(self.hierarchy, outer, token) {
                if field.is_private() {
                    return Err(cursor.error("private member access between nestmates is not supported"));
                }
                let outer = self.class(cursor, outer)?;
                if !field.is_static() {
                    chain.push(ReferenceChainElement::ThisReference {
                        class: caller.name.clone(),
                    });
                    chain.push(self.qualified_this(cursor, caller, &outer.name)?);
                }
                return self.after_field(cursor, caller, &outer, &outer, declaring, field, false, chain);
            }
        }

        for outer in &enclosing {
            if simple_name_of(outer) == token {
                let outer = self.class(cursor, outer)?;
                return self.after_class_name(cursor, caller, &outer, chain);
            }
        }
        if caller.simple_name() == token {
            return self.after_class_name(cursor, caller, caller, chain);
        }

        let package = caller.package();
        let sibling = if package.is_empty() {
            token.to_string()
        } else {
            format!("{package}/{token}")
        };
        if let Some(class) = self.hierarchy.class_info(&sibling) {
            return self.after_class_name(cursor, caller, &class, chain);
        }

        // Longest run of leading tokens naming a class wins the first match.
        let mut qualified = token.to_string();
        while let Some(next) = cursor.next() {
            qualified.push('/');
            qualified.push_str(next);
            if let Some(class) = self.hierarchy.class_info(&qualified) {
                return self.after_class_name(cursor, caller, &class, chain);
            }
        }
        Err(cursor.error(format!(
            "'{token}' is neither a field of {} nor a known class",
            caller.name
        )))
    }

    /// `this` or `Outer.this`, optionally followed by a field path.
    fn after_this(
        &self,
        cursor: &mut Cursor<'_>,
        caller: &Arc<ClassInfo>,
        target: &Arc<ClassInfo>,
        chain: &mut ResolvedReferenceChain,
    ) -> Result<(), ResolveError> {
        chain.push(ReferenceChainElement::ThisReference {
            class: caller.name.clone(),
        });
        if target.name != caller.name {
            chain.push(self.qualified_this(cursor, caller, &target.name)?);
        }
        match cursor.next() {
            None => Ok(()),
            Some(THIS) | Some(SUPER) => Err(cursor.error("'this' and 'super' may only start a path")),
            Some(token) => {
                let (declaring, field) = self.lookup_field(cursor, target, token)?;
                self.after_field(cursor, caller, target, target, declaring, field, false, chain)
            }
        }
    }

    /// `super.f` or `Outer.super.f`: the field is looked up from the
    /// superclass but read through the receiver.
    fn after_super(
        &self,
        cursor: &mut Cursor<'_>,
        caller: &Arc<ClassInfo>,
        target: &Arc<ClassInfo>,
        chain: &mut ResolvedReferenceChain,
    ) -> Result<(), ResolveError> {
        let Some(super_name) = target.super_name.as_deref() else {
            return Err(cursor.error(format!("{} has no superclass", target.name)));
        };
        let super_class = self.class(cursor, super_name)?;
        chain.push(ReferenceChainElement::ThisReference {
            class: caller.name.clone(),
        });
        if target.name != caller.name {
            chain.push(self.qualified_this(cursor, caller, &target.name)?);
        }
        match cursor.next() {
            None => Err(cursor.error("'super' must be followed by a field")),
            Some(THIS) | Some(SUPER) => Err(cursor.error("'this' and 'super' may only start a path")),
            Some(token) => {
                let (declaring, field) = self.lookup_field(cursor, &super_class, token)?;
                self.after_field(cursor, caller, &super_class, target, declaring, field, false, chain)
            }
        }
    }

    /// A class name: `this`, `super` (enclosing or own class only) or a
    /// static field must follow.
    fn after_class_name(
        &self,
        cursor: &mut Cursor<'_>,
        caller: &Arc<ClassInfo>,
        class: &Arc<ClassInfo>,
        chain: &mut ResolvedReferenceChain,
    ) -> Result<(), ResolveError> {
        let is_enclosing_or_self = class.name == caller.name
            || enclosing_classes(self.hierarchy, &caller.name).contains(&class.name);
        match cursor.next() {
            None => Err(cursor.error(format!("expected a field after class name {}", class.name))),
            Some(THIS) if is_enclosing_or_self => self.after_this(cursor, caller, class, chain),
            Some(SUPER) if is_enclosing_or_self => self.after_super(cursor, caller, class, chain),
            Some(THIS) | Some(SUPER) => Err(cursor.error(format!(
                "{} is not an enclosing class of {}",
                class.name, caller.name
            ))),
            Some(token) => {
                let (declaring, field) = self.lookup_field(cursor, class, token)?;
                self.after_field(cursor, caller, class, class, declaring, field, true, chain)
            }
        }
    }

    /// Push a resolved field, then continue with the field's type as the new
    /// membering class.
    #[allow(clippy::too_many_arguments)]
    fn after_field(
        &self,
        cursor: &mut Cursor<'_>,
        caller: &Arc<ClassInfo>,
        membering: &Arc<ClassInfo>,
        receiver: &ClassInfo,
        declaring: Arc<ClassInfo>,
        field: FieldMember,
        static_context: bool,
        chain: &mut ResolvedReferenceChain,
    ) -> Result<(), ResolveError> {
        if static_context && !field.is_static() {
            return Err(cursor.error(format!(
                "'{}' is not a static field of {}",
                field.name, membering.name
            )));
        }
        if field.is_private()
            && membering.name != caller.name
            && are_nestmates(self.hierarchy, &declaring, caller)
        {
            return Err(cursor.error("private member access between nestmates is not supported"));
        }
        if !self.verifier.is_accessible(receiver, &declaring, &field, caller) {
            return Err(ResolveError::AccessibilityViolation {
                field: field.name.clone(),
                access: field.access_keyword(),
                declaring: declaring.name.clone(),
                caller: caller.name.clone(),
            });
        }
        let Some(field_type) = field.field_type() else {
            return Err(cursor.error(format!(
                "field '{}' has malformed descriptor {}",
                field.name, field.descriptor
            )));
        };

        chain.push(ReferenceChainElement::FieldReference {
            owner: membering.name.clone(),
            declaring_class: declaring.name.clone(),
            name: field.name.clone(),
            field_type: field_type.clone(),
            modifiers: field.access_flags,
        });

        match cursor.next() {
            None => Ok(()),
            Some(THIS) | Some(SUPER) => Err(cursor.error("'this' and 'super' may only start a path")),
            Some(token) => {
                let JavaType::Object(next_class) = &field_type else {
                    return Err(cursor.error(format!(
                        "cannot read '{token}' from '{}' of type {field_type}",
                        field.name
                    )));
                };
                let next = self.class(cursor, next_class)?;
                let (declaring, field) = self.lookup_field(cursor, &next, token)?;
                self.after_field(cursor, caller, &next, &next, declaring, field, false, chain)
            }
        }
    }

    fn lookup_field(
        &self,
        cursor: &Cursor<'_>,
        class: &ClassInfo,
        token: &str,
    ) -> Result<(Arc<ClassInfo>, FieldMember), ResolveError> {
        if !is_valid_identifier(token) {
            return Err(cursor.error(format!("'{token}' is not a valid field name")));
        }
        find_field(self.hierarchy, &class.name, token).ok_or_else(|| {
            cursor.error(format!(
                "field '{token}' not found in {} or its supertypes",
                class.name
            ))
        })
    }

    /// Outer instance of `caller` of class `target`, through the synthetic
    /// `this$N` fields of every class in between.
    fn qualified_this(
        &self,
        cursor: &Cursor<'_>,
        caller: &ClassInfo,
        target: &str,
    ) -> Result<ReferenceChainElement, ResolveError> {
        let enclosing = enclosing_classes(self.hierarchy, &caller.name);
        let Some(position) = enclosing.iter().position(|name| name == target) else {
            return Err(cursor.error(format!(
                "{target} is not an enclosing class of {}",
                caller.name
            )));
        };

        let mut links = Vec::with_capacity(position + 1);
        let mut inner = caller.name.clone();
        for outer in &enclosing[..=position] {
            let inner_info = self.class(cursor, &inner)?;
            let descriptor = format!("L{outer};");
            let Some(link) = inner_info
                .fields
                .iter()
                .find(|f| f.name.starts_with("this$") && f.descriptor == descriptor && !f.is_static())
            else {
                return Err(cursor.error(format!(
                    "{inner} has no enclosing instance of {outer}"
                )));
            };
            links.push(OuterLink {
                owner: inner.clone(),
                name: link.name.clone(),
                target: outer.clone(),
            });
            inner = outer.clone();
        }

        Ok(ReferenceChainElement::QualifiedThisReference {
            depth: links.len(),
            enclosing: target.to_string(),
            links,
        })
    }

    fn class(&self, cursor: &Cursor<'_>, name: &str) -> Result<Arc<ClassInfo>, ResolveError> {
        self.hierarchy
            .class_info(name)
            .ok_or_else(|| cursor.error(format!("class {name} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::InMemoryHierarchy;
    use probe_classfile::access;

    fn hierarchy() -> InMemoryHierarchy {
        InMemoryHierarchy::new()
            .with(
                ClassInfo::new("com/x/Base")
                    .with_field("baseCount", "I", access::PROTECTED)
                    .with_field("secret", "I", access::PRIVATE),
            )
            .with(
                ClassInfo::new("com/x/Demo")
                    .with_super("com/x/Base")
                    .with_field("count", "I", access::PRIVATE)
                    .with_field("holder", "Lcom/x/Holder;", 0)
                    .with_field("name", "Ljava/lang/String;", 0)
                    .with_field("values", "[I", 0)
                    .with_field("LIMIT", "J", access::PUBLIC | access::STATIC | access::FINAL),
            )
            .with(
                ClassInfo::new("com/x/Holder")
                    .with_field("next", "Lcom/x/Holder;", access::PUBLIC)
                    .with_field("value", "D", access::PUBLIC)
                    .with_field("hidden", "I", access::PRIVATE)
                    .with_field("INSTANCE", "Lcom/x/Holder;", access::PUBLIC | access::STATIC),
            )
            .with(
                ClassInfo::new("com/x/Demo$Inner")
                    .enclosed_in("com/x/Demo")
                    .with_field("this$0", "Lcom/x/Demo;", access::FINAL | access::SYNTHETIC)
                    .with_field("own", "I", 0),
            )
            .with(
                ClassInfo::new("com/x/Demo$Inner$Deep")
                    .enclosed_in("com/x/Demo$Inner")
                    .with_field("this$1", "Lcom/x/Demo$Inner;", access::FINAL | access::SYNTHETIC),
            )
            .with(ClassInfo::new("com/x/Demo$Nested").enclosed_in("com/x/Demo"))
            .with(ClassInfo::new("java/lang/String").with_field("value", "[B", access::PRIVATE))
            .with(
                ClassInfo::new("org/y/Config")
                    .with_field("MODE", "Ljava/lang/String;", access::PUBLIC | access::STATIC)
                    .with_field("level", "I", access::PUBLIC),
            )
    }

    fn resolve(caller: &str, expression: &str) -> Result<ResolvedReferenceChain, ResolveError> {
        let h = hierarchy();
        ReferenceChainResolver::new(&h).resolve(caller, expression)
    }

    fn names(chain: &ResolvedReferenceChain) -> Vec<String> {
        chain.elements().iter().map(|e| e.to_string()).collect()
    }

    #[test]
    fn test_simple_and_this_fields() {
        let chain = resolve("com/x/Demo", "count").unwrap();
        assert_eq!(names(&chain), vec!["count"]);
        assert_eq!(chain.chain_type(), JavaType::Int);

        let chain = resolve("com/x/Demo", "this.holder.next.value").unwrap();
        assert_eq!(names(&chain), vec!["this", "holder", "next", "value"]);
        assert_eq!(chain.chain_type(), JavaType::Double);

        let chain = resolve("com/x/Demo", "this").unwrap();
        assert_eq!(chain.chain_type(), JavaType::Object("com/x/Demo".into()));
    }

    #[test]
    fn test_inherited_fields() {
        let chain = resolve("com/x/Demo", "baseCount").unwrap();
        match &chain.elements()[0] {
            ReferenceChainElement::FieldReference { owner, declaring_class, .. } => {
                assert_eq!(owner, "com/x/Demo");
                assert_eq!(declaring_class, "com/x/Base");
            }
            other => panic!("unexpected element {other:?}"),
        }
        let chain = resolve("com/x/Demo", "super.baseCount").unwrap();
        assert_eq!(names(&chain), vec!["this", "baseCount"]);

        // Private in the superclass: found, but not readable.
        assert!(matches!(
            resolve("com/x/Demo", "secret"),
            Err(ResolveError::AccessibilityViolation { .. })
        ));
    }

    #[test]
    fn test_static_forms() {
        let chain = resolve("com/x/Demo", "Demo.LIMIT").unwrap();
        assert!(chain.elements()[0].is_static());
        assert_eq!(chain.chain_type(), JavaType::Long);

        let chain = resolve("com/x/Demo", "Holder.INSTANCE.next").unwrap();
        assert_eq!(chain.len(), 2);

        let chain = resolve("com/x/Demo", "org.y.Config.MODE").unwrap();
        assert_eq!(chain.chain_type(), JavaType::string());

        // Instance field through a class name.
        assert!(resolve("com/x/Demo", "org.y.Config.level").is_err());
    }

    #[test]
    fn test_outer_instance_access() {
        let chain = resolve("com/x/Demo$Inner", "count").unwrap_err();
        assert!(chain.to_string().contains("nestmates"));

        let chain = resolve("com/x/Demo$Inner", "holder.value").unwrap();
        assert_eq!(chain.elements().len(), 4);
        match &chain.elements()[1] {
            ReferenceChainElement::QualifiedThisReference { depth, links, .. } => {
                assert_eq!(*depth, 1);
                assert_eq!(links[0].name, "this$0");
            }
            other => panic!("unexpected element {other:?}"),
        }

        let chain = resolve("com/x/Demo$Inner$Deep", "Demo.this.holder").unwrap();
        match &chain.elements()[1] {
            ReferenceChainElement::QualifiedThisReference { depth, links, enclosing } => {
                assert_eq!(*depth, 2);
                assert_eq!(enclosing, "com/x/Demo");
                assert_eq!(links[0].name, "this$1");
                assert_eq!(links[1].name, "this$0");
            }
            other => panic!("unexpected element {other:?}"),
        }
        assert_eq!(chain.to_string(), "Demo.this.holder");

        // Static nested classes carry no outer instance.
        assert!(resolve("com/x/Demo$Nested", "Demo.this.holder").is_err());
        // Static fields of enclosing classes need no instance.
        let chain = resolve("com/x/Demo$Nested", "LIMIT").unwrap();
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_errors() {
        for expression in ["", "a..b", "holder.", "missing", "this.this", "count.value", "values.length", "super"] {
            assert!(
                matches!(resolve("com/x/Demo", expression), Err(ResolveError::ReferenceResolution { .. })),
                "{expression} should not resolve"
            );
        }
        assert!(matches!(
            resolve("com/x/Demo", "holder.hidden"),
            Err(ResolveError::AccessibilityViolation { .. })
        ));
        assert!(resolve("com/x/Missing", "count").is_err());
    }
}
