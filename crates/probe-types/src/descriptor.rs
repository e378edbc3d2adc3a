//! JVM type and method descriptors.
//!
//! Descriptors are the textual type encoding used throughout class files
//! (`I`, `J`, `Ljava/lang/String;`, `[[D`, `(ILjava/lang/Object;)V`). Everything
//! in the workspace that needs to reason about operand sizes, zero values or
//! record field types goes through [`JavaType`] and [`MethodType`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Internal name of `java.lang.String`.
pub const STRING_INTERNAL_NAME: &str = "java/lang/String";
/// Internal name of `java.lang.Object`.
pub const OBJECT_INTERNAL_NAME: &str = "java/lang/Object";
/// Internal name of `java.lang.Throwable`.
pub const THROWABLE_INTERNAL_NAME: &str = "java/lang/Throwable";
/// Internal name of `java.lang.Thread`.
pub const THREAD_INTERNAL_NAME: &str = "java/lang/Thread";
/// Internal name of `java.lang.Class`.
pub const CLASS_INTERNAL_NAME: &str = "java/lang/Class";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid descriptor '{descriptor}': {reason}")]
pub struct DescriptorError {
    pub descriptor: String,
    pub reason: &'static str,
}

impl DescriptorError {
    fn new(descriptor: &str, reason: &'static str) -> Self {
        Self {
            descriptor: descriptor.to_string(),
            reason,
        }
    }
}

// =============================================================================
// Field Types
// =============================================================================

/// A JVM field type (or `void` for method returns).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JavaType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Void,
    /// A class or interface type, by internal name (`java/lang/String`)
    Object(String),
    /// An array type with its component type
    Array(Box<JavaType>),
}

impl JavaType {
    /// Parse a complete field descriptor such as `I` or `[Ljava/lang/String;`.
    pub fn parse(descriptor: &str) -> Result<Self, DescriptorError> {
        match Self::parse_prefix(descriptor) {
            Some((ty, "")) => Ok(ty),
            Some(_) => Err(DescriptorError::new(descriptor, "trailing characters")),
            None => Err(DescriptorError::new(descriptor, "malformed field type")),
        }
    }

    /// Parse one type at the start of `input`, returning it with the rest.
    fn parse_prefix(input: &str) -> Option<(JavaType, &str)> {
        let mut chars = input.chars();
        let head = chars.next()?;
        let rest = chars.as_str();
        let ty = match head {
            'Z' => JavaType::Boolean,
            'B' => JavaType::Byte,
            'C' => JavaType::Char,
            'S' => JavaType::Short,
            'I' => JavaType::Int,
            'J' => JavaType::Long,
            'F' => JavaType::Float,
            'D' => JavaType::Double,
            'V' => JavaType::Void,
            'L' => {
                let end = rest.find(';')?;
                let name = &rest[..end];
                if name.is_empty() || name.split('/').any(str::is_empty) {
                    return None;
                }
                return Some((JavaType::Object(name.to_string()), &rest[end + 1..]));
            }
            '[' => {
                let (component, rest) = Self::parse_prefix(rest)?;
                if component == JavaType::Void {
                    return None;
                }
                return Some((JavaType::Array(Box::new(component)), rest));
            }
            _ => return None,
        };
        Some((ty, rest))
    }

    /// Build a type from a class-file internal name. Array classes are named by
    /// their descriptor (`[I`), everything else is an object type.
    pub fn from_internal_name(name: &str) -> Self {
        if name.starts_with('[') {
            if let Ok(ty) = Self::parse(name) {
                return ty;
            }
        }
        JavaType::Object(name.to_string())
    }

    pub fn string() -> Self {
        JavaType::Object(STRING_INTERNAL_NAME.to_string())
    }

    pub fn object() -> Self {
        JavaType::Object(OBJECT_INTERNAL_NAME.to_string())
    }

    /// The descriptor form of this type.
    pub fn descriptor(&self) -> String {
        match self {
            JavaType::Boolean => "Z".to_string(),
            JavaType::Byte => "B".to_string(),
            JavaType::Char => "C".to_string(),
            JavaType::Short => "S".to_string(),
            JavaType::Int => "I".to_string(),
            JavaType::Long => "J".to_string(),
            JavaType::Float => "F".to_string(),
            JavaType::Double => "D".to_string(),
            JavaType::Void => "V".to_string(),
            JavaType::Object(name) => format!("L{};", name),
            JavaType::Array(component) => format!("[{}", component.descriptor()),
        }
    }

    /// The name used in `CONSTANT_Class` entries: the internal name for object
    /// types, the descriptor for arrays, `None` for primitives.
    pub fn internal_name(&self) -> Option<String> {
        match self {
            JavaType::Object(name) => Some(name.clone()),
            JavaType::Array(_) => Some(self.descriptor()),
            _ => None,
        }
    }

    pub fn is_primitive(&self) -> bool {
        !matches!(
            self,
            JavaType::Object(_) | JavaType::Array(_) | JavaType::Void
        )
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, JavaType::Object(_) | JavaType::Array(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, JavaType::Object(name) if name == STRING_INTERNAL_NAME)
    }

    /// Whether values of this type are held as `int` on the operand stack.
    pub fn is_int_like(&self) -> bool {
        matches!(
            self,
            JavaType::Boolean | JavaType::Byte | JavaType::Char | JavaType::Short | JavaType::Int
        )
    }

    /// Number of local/stack slots a value of this type occupies.
    pub fn slot_size(&self) -> u16 {
        match self {
            JavaType::Void => 0,
            JavaType::Long | JavaType::Double => 2,
            _ => 1,
        }
    }

    pub fn is_wide(&self) -> bool {
        self.slot_size() == 2
    }
}

impl fmt::Display for JavaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JavaType::Boolean => write!(f, "boolean"),
            JavaType::Byte => write!(f, "byte"),
            JavaType::Char => write!(f, "char"),
            JavaType::Short => write!(f, "short"),
            JavaType::Int => write!(f, "int"),
            JavaType::Long => write!(f, "long"),
            JavaType::Float => write!(f, "float"),
            JavaType::Double => write!(f, "double"),
            JavaType::Void => write!(f, "void"),
            JavaType::Object(name) => write!(f, "{}", name.replace('/', ".")),
            JavaType::Array(component) => write!(f, "{}[]", component),
        }
    }
}

// =============================================================================
// Method Types
// =============================================================================

/// A parsed method descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodType {
    pub params: Vec<JavaType>,
    pub ret: JavaType,
}

impl MethodType {
    /// Parse a method descriptor such as `(IJLjava/lang/String;)V`.
    pub fn parse(descriptor: &str) -> Result<Self, DescriptorError> {
        let inner = descriptor
            .strip_prefix('(')
            .ok_or_else(|| DescriptorError::new(descriptor, "missing '('"))?;
        let close = inner
            .find(')')
            .ok_or_else(|| DescriptorError::new(descriptor, "missing ')'"))?;

        let mut params = Vec::new();
        let mut rest = &inner[..close];
        while !rest.is_empty() {
            let (ty, tail) = JavaType::parse_prefix(rest)
                .ok_or_else(|| DescriptorError::new(descriptor, "malformed parameter type"))?;
            if ty == JavaType::Void {
                return Err(DescriptorError::new(descriptor, "void parameter"));
            }
            params.push(ty);
            rest = tail;
        }

        let ret = JavaType::parse(&inner[close + 1..])
            .map_err(|_| DescriptorError::new(descriptor, "malformed return type"))?;
        Ok(Self { params, ret })
    }

    pub fn descriptor(&self) -> String {
        let params: String = self.params.iter().map(JavaType::descriptor).collect();
        format!("({}){}", params, self.ret.descriptor())
    }

    /// Local variable slot holding argument `index`.
    pub fn arg_slot(&self, index: usize, is_static: bool) -> Option<u16> {
        if index >= self.params.len() {
            return None;
        }
        let base: u16 = if is_static { 0 } else { 1 };
        Some(base + self.params[..index].iter().map(JavaType::slot_size).sum::<u16>())
    }

    /// Slots taken by the receiver (if any) and all arguments.
    pub fn arg_slots(&self, is_static: bool) -> u16 {
        let base: u16 = if is_static { 0 } else { 1 };
        base + self.params.iter().map(JavaType::slot_size).sum::<u16>()
    }
}

// =============================================================================
// Names
// =============================================================================

fn is_identifier_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_identifier_part(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Whether `name` is a single Java identifier.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if is_identifier_start(first) => chars.all(is_identifier_part),
        _ => false,
    }
}

/// Whether `name` is a qualified class name in either dotted or internal form.
pub fn is_valid_class_name(name: &str) -> bool {
    !name.is_empty() && name.split(['.', '/']).all(is_valid_identifier)
}

/// Convert `com.company.Foo` to `com/company/Foo`. Internal names pass through.
pub fn to_internal_name(name: &str) -> String {
    name.trim().replace('.', "/")
}

/// Package portion of an internal name (`com/x` for `com/x/Foo`, empty for the
/// unnamed package).
pub fn package_of(internal_name: &str) -> &str {
    match internal_name.rfind('/') {
        Some(idx) => &internal_name[..idx],
        None => "",
    }
}

/// Simple name of an internal name, without package or enclosing classes.
pub fn simple_name_of(internal_name: &str) -> &str {
    let base = match internal_name.rfind('/') {
        Some(idx) => &internal_name[idx + 1..],
        None => internal_name,
    };
    match base.rfind('$') {
        Some(idx) if idx + 1 < base.len() => &base[idx + 1..],
        _ => base,
    }
}

/// Keep only identifier characters and upper-case the first one, so that
/// `"demo.event 1"` becomes `"Demoevent1"`.
pub fn identifier_part(text: &str) -> String {
    let kept: String = text.chars().filter(|c| is_identifier_part(*c)).collect();
    let mut chars = kept.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_primitive_and_object_types() {
        assert_eq!(JavaType::parse("I").unwrap(), JavaType::Int);
        assert_eq!(JavaType::parse("J").unwrap().slot_size(), 2);
        assert_eq!(
            JavaType::parse("Ljava/lang/String;").unwrap(),
            JavaType::string()
        );
        assert_eq!(
            JavaType::parse("[[D").unwrap(),
            JavaType::Array(Box::new(JavaType::Array(Box::new(JavaType::Double))))
        );
    }

    #[test]
    fn test_parse_rejects_malformed_types() {
        assert!(JavaType::parse("").is_err());
        assert!(JavaType::parse("Ljava/lang/String").is_err());
        assert!(JavaType::parse("II").is_err());
        assert!(JavaType::parse("[V").is_err());
        assert!(JavaType::parse("L;").is_err());
    }

    #[test]
    fn test_method_type_slots() {
        let mt = MethodType::parse("(IJLjava/lang/String;D)J").unwrap();
        assert_eq!(mt.params.len(), 4);
        assert_eq!(mt.ret, JavaType::Long);
        assert_eq!(mt.arg_slot(0, false), Some(1));
        assert_eq!(mt.arg_slot(2, false), Some(4));
        assert_eq!(mt.arg_slot(3, true), Some(4));
        assert_eq!(mt.arg_slot(4, true), None);
        assert_eq!(mt.arg_slots(false), 7);
    }

    #[test]
    fn test_method_type_rejects_bad_descriptors() {
        assert!(MethodType::parse("I)V").is_err());
        assert!(MethodType::parse("(I").is_err());
        assert!(MethodType::parse("(V)V").is_err());
        assert!(MethodType::parse("()").is_err());
    }

    #[test]
    fn test_names() {
        assert!(is_valid_class_name("com.company.project.MyClass"));
        assert!(is_valid_class_name("MyClass$MyInnerClass"));
        assert!(!is_valid_class_name("not a valid name"));
        assert_eq!(to_internal_name("com.x.Foo"), "com/x/Foo");
        assert_eq!(package_of("com/x/Foo"), "com/x");
        assert_eq!(package_of("Foo"), "");
        assert_eq!(simple_name_of("com/x/Outer$Inner"), "Inner");
        assert_eq!(identifier_part("demo.event 1"), "Demoevent1");
        assert_eq!(identifier_part("arg0"), "Arg0");
    }

    fn arb_type() -> impl Strategy<Value = JavaType> {
        let leaf = prop_oneof![
            Just(JavaType::Boolean),
            Just(JavaType::Int),
            Just(JavaType::Long),
            Just(JavaType::Double),
            "[a-z]{1,6}(/[A-Z][a-z]{0,6}){1,2}".prop_map(JavaType::Object),
        ];
        leaf.prop_recursive(3, 8, 1, |inner| {
            inner.prop_map(|t| JavaType::Array(Box::new(t)))
        })
    }

    proptest! {
        #[test]
        fn prop_descriptor_parse_inverts_format(params in prop::collection::vec(arb_type(), 0..5), ret in arb_type()) {
            let mt = MethodType { params, ret };
            let parsed = MethodType::parse(&mt.descriptor()).unwrap();
            prop_assert_eq!(parsed, mt);
        }
    }
}
