//! Resolved reference chains.

use std::fmt;

use probe_agent_types::JavaType;
use probe_classfile::access;

/// One synthetic outer-instance field (`this$N`) walked by a qualified `this`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OuterLink {
    /// Inner class declaring the field
    pub owner: String,
    pub name: String,
    /// Enclosing class the field points to
    pub target: String,
}

impl OuterLink {
    pub fn descriptor(&self) -> String {
        format!("L{};", self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceChainElement {
    /// The receiver of the instrumented method.
    ThisReference { class: String },
    /// A field read. `owner` is the class the field was looked up on and is
    /// what the generated field instruction names; `declaring_class` is where
    /// the field actually lives.
    FieldReference {
        owner: String,
        declaring_class: String,
        name: String,
        field_type: JavaType,
        modifiers: u16,
    },
    /// `Outer.this`: `depth` outer-instance hops from the current receiver.
    QualifiedThisReference {
        depth: usize,
        enclosing: String,
        links: Vec<OuterLink>,
    },
}

impl ReferenceChainElement {
    pub fn is_static(&self) -> bool {
        match self {
            ReferenceChainElement::FieldReference { modifiers, .. } => {
                modifiers & access::STATIC != 0
            }
            _ => false,
        }
    }

    /// The type of the value this element leaves on the stack.
    pub fn value_type(&self) -> JavaType {
        match self {
            ReferenceChainElement::ThisReference { class } => JavaType::Object(class.clone()),
            ReferenceChainElement::FieldReference { field_type, .. } => field_type.clone(),
            ReferenceChainElement::QualifiedThisReference { enclosing, .. } => {
                JavaType::Object(enclosing.clone())
            }
        }
    }

    pub fn is_receiver(&self) -> bool {
        matches!(
            self,
            ReferenceChainElement::ThisReference { .. }
                | ReferenceChainElement::QualifiedThisReference { .. }
        )
    }
}

impl fmt::Display for ReferenceChainElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceChainElement::ThisReference { .. } => write!(f, "this"),
            ReferenceChainElement::FieldReference { owner, name, .. } => {
                if self.is_static() {
                    write!(f, "{}.{}", owner.replace('/', "."), name)
                } else {
                    write!(f, "{}", name)
                }
            }
            ReferenceChainElement::QualifiedThisReference { enclosing, .. } => {
                write!(f, "{}.this", probe_agent_types::simple_name_of(enclosing))
            }
        }
    }
}

/// An ordered, typed chain of references evaluated from the instrumented
/// method's context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedReferenceChain {
    caller: String,
    elements: Vec<ReferenceChainElement>,
}

impl ResolvedReferenceChain {
    pub fn new(caller: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
            elements: Vec::new(),
        }
    }

    pub fn with_elements(caller: impl Into<String>, elements: Vec<ReferenceChainElement>) -> Self {
        Self {
            caller: caller.into(),
            elements,
        }
    }

    pub fn push(&mut self, element: ReferenceChainElement) {
        self.elements.push(element);
    }

    pub fn elements(&self) -> &[ReferenceChainElement] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Leaf type, or the caller's type for an empty chain.
    pub fn chain_type(&self) -> JavaType {
        self.elements
            .last()
            .map(ReferenceChainElement::value_type)
            .unwrap_or_else(|| JavaType::Object(self.caller.clone()))
    }

    /// Whether evaluating the chain needs the receiver, which static methods
    /// do not have.
    pub fn requires_receiver(&self) -> bool {
        self.elements.first().is_some_and(|e| !e.is_static())
    }

    /// Drop everything before each static element, since a static read needs
    /// no instance path. An instance field left at the head gets an explicit
    /// receiver. Static-final constants are not folded.
    pub fn normalize(&self) -> Self {
        let mut elements: Vec<ReferenceChainElement> = Vec::with_capacity(self.elements.len() + 1);
        for element in &self.elements {
            if element.is_static() {
                elements.clear();
            }
            elements.push(element.clone());
        }
        if let Some(first) = elements.first() {
            if !first.is_static() && !first.is_receiver() {
                elements.insert(
                    0,
                    ReferenceChainElement::ThisReference {
                        class: self.caller.clone(),
                    },
                );
            }
        }
        Self {
            caller: self.caller.clone(),
            elements,
        }
    }
}

impl fmt::Display for ResolvedReferenceChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for element in &self.elements {
            // The qualified form already prints as `Outer.this`.
            if let ReferenceChainElement::ThisReference { .. } = element {
                if matches!(
                    self.elements.get(1),
                    Some(ReferenceChainElement::QualifiedThisReference { .. })
                ) {
                    continue;
                }
            }
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{element}")?;
            first = false;
        }
        if first {
            f.write_str("this")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn field(name: &str, is_static: bool) -> ReferenceChainElement {
        ReferenceChainElement::FieldReference {
            owner: "p/Holder".to_string(),
            declaring_class: "p/Holder".to_string(),
            name: name.to_string(),
            field_type: JavaType::Object("p/Holder".to_string()),
            modifiers: if is_static { access::STATIC } else { access::PRIVATE },
        }
    }

    fn this() -> ReferenceChainElement {
        ReferenceChainElement::ThisReference {
            class: "p/Caller".to_string(),
        }
    }

    #[test]
    fn test_normalize_drops_prefix_before_static() {
        let chain = ResolvedReferenceChain::with_elements(
            "p/Caller",
            vec![this(), field("a", false), field("S", true), field("b", false)],
        );
        let normalized = chain.normalize();
        assert_eq!(normalized.elements(), &[field("S", true), field("b", false)]);
        assert!(!normalized.requires_receiver());
    }

    #[test]
    fn test_normalize_prepends_receiver() {
        let chain = ResolvedReferenceChain::with_elements("p/Caller", vec![field("a", false)]);
        let normalized = chain.normalize();
        assert_eq!(normalized.elements(), &[this(), field("a", false)]);
        assert!(normalized.requires_receiver());
    }

    #[test]
    fn test_chain_type_of_empty_chain_is_caller() {
        let chain = ResolvedReferenceChain::new("p/Caller");
        assert_eq!(chain.chain_type(), JavaType::Object("p/Caller".to_string()));
        assert_eq!(chain.to_string(), "this");
        assert_eq!(chain.normalize(), chain);
    }

    #[test]
    fn test_display() {
        let chain = ResolvedReferenceChain::with_elements(
            "p/Caller",
            vec![this(), field("a", false), field("b", false)],
        );
        assert_eq!(chain.to_string(), "this.a.b");
        let chain = ResolvedReferenceChain::with_elements("p/Caller", vec![field("S", true)]);
        assert_eq!(chain.to_string(), "p.Holder.S");
    }

    fn element_strategy() -> impl Strategy<Value = ReferenceChainElement> {
        prop_oneof![
            Just(this()),
            ("[a-z]{1,4}", any::<bool>()).prop_map(|(name, is_static)| field(&name, is_static)),
        ]
    }

    proptest! {
        #[test]
        fn test_normalize_idempotent(elements in prop::collection::vec(element_strategy(), 0..8)) {
            let chain = ResolvedReferenceChain::with_elements("p/Caller", elements.clone());
            let once = chain.normalize();
            prop_assert_eq!(once.normalize(), once.clone());

            // Nothing survives in front of the last static element.
            if let Some(last_static) = elements.iter().rposition(ReferenceChainElement::is_static) {
                prop_assert_eq!(&once.elements()[0], &elements[last_static]);
                prop_assert_eq!(once.len(), elements.len() - last_static);
            }
        }
    }
}
