//! Static shapes of rewritten expressions and the method dispatch table.
//!
//! Filtering a navigation changes its static shape: a stored collection
//! becomes a filtered sequence. Every sequence call is re-resolved against
//! the shape of its rewritten receiver through [`resolve_call`], and any
//! combination missing from the table is rejected rather than evaluated.

use warden_proto::Method;

use crate::security::{SecurityError, SecurityResult};

/// Static shape of an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    /// Scalar value.
    Scalar,
    /// One entity of the given type (or null).
    Entity(String),
    /// A stored collection navigation, unfiltered.
    Collection(String),
    /// A filtered or reordered entity sequence.
    Sequence(String),
    /// A sequence of non-entity values.
    Values,
    /// A constructed record with the shapes of its fields.
    Record(Vec<(String, Shape)>),
}

impl Shape {
    /// Shape of one element when this is a sequence.
    pub fn element(&self) -> Option<Shape> {
        match self {
            Shape::Collection(entity) | Shape::Sequence(entity) => {
                Some(Shape::Entity(entity.clone()))
            }
            Shape::Values => Some(Shape::Scalar),
            _ => None,
        }
    }

    /// Whether this is any kind of sequence.
    pub fn is_sequence(&self) -> bool {
        matches!(
            self,
            Shape::Collection(_) | Shape::Sequence(_) | Shape::Values
        )
    }

    /// Shape of a record field, `Scalar` when unknown.
    pub fn field(&self, name: &str) -> Shape {
        match self {
            Shape::Record(fields) => fields
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, shape)| shape.clone())
                .unwrap_or(Shape::Scalar),
            _ => Shape::Scalar,
        }
    }
}

/// Receiver categories the table distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Receiver {
    Collection,
    Sequence,
    Values,
}

/// How a call's result shape follows from its receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Yields {
    /// Same elements, filtered or reordered.
    Filtered,
    /// Same elements, materialized into a list.
    Materialized,
    /// One element.
    Element,
    /// A scalar (boolean or count).
    Scalar,
    /// One projected value per element.
    Projected,
    /// Concatenated projected sequences.
    Flattened,
    /// Elements of the type argument.
    Narrowed,
}

struct Signature {
    method: &'static str,
    receivers: &'static [Receiver],
    arities: &'static [usize],
    yields: Yields,
}

const ANY_SEQUENCE: &[Receiver] = &[Receiver::Collection, Receiver::Sequence, Receiver::Values];
const ENTITY_SEQUENCE: &[Receiver] = &[Receiver::Collection, Receiver::Sequence];

macro_rules! signature {
    ($method:literal, $receivers:expr, [$($arity:literal),*], $yields:ident) => {
        Signature {
            method: $method,
            receivers: $receivers,
            arities: &[$($arity),*],
            yields: Yields::$yields,
        }
    };
}

const DISPATCH: &[Signature] = &[
    signature!("Where", ANY_SEQUENCE, [1], Filtered),
    signature!("Select", ANY_SEQUENCE, [1], Projected),
    signature!("SelectMany", ANY_SEQUENCE, [1], Flattened),
    signature!("Any", ANY_SEQUENCE, [0, 1], Scalar),
    signature!("All", ANY_SEQUENCE, [1], Scalar),
    signature!("Count", ANY_SEQUENCE, [0, 1], Scalar),
    signature!("Contains", ANY_SEQUENCE, [1], Scalar),
    signature!("OrderBy", ANY_SEQUENCE, [1], Filtered),
    signature!("OrderByDescending", ANY_SEQUENCE, [1], Filtered),
    signature!("ThenBy", ANY_SEQUENCE, [1], Filtered),
    signature!("ThenByDescending", ANY_SEQUENCE, [1], Filtered),
    signature!("Skip", ANY_SEQUENCE, [1], Filtered),
    signature!("Take", ANY_SEQUENCE, [1], Filtered),
    signature!("First", ANY_SEQUENCE, [0, 1], Element),
    signature!("FirstOrDefault", ANY_SEQUENCE, [0, 1], Element),
    signature!("ToList", ANY_SEQUENCE, [0], Materialized),
    signature!("OfType", ENTITY_SEQUENCE, [0], Narrowed),
];

/// Result shape of `receiver.method(args)`.
///
/// `projection` is the shape of the lambda body for projecting methods.
pub fn resolve_call(
    method: &Method,
    receiver: &Shape,
    arity: usize,
    projection: Option<&Shape>,
) -> SecurityResult<Shape> {
    let unsupported = || {
        SecurityError::UnsupportedShape(format!(
            "{}/{} on {:?}",
            method.name(),
            arity,
            receiver
        ))
    };

    let category = match receiver {
        Shape::Collection(_) => Receiver::Collection,
        Shape::Sequence(_) => Receiver::Sequence,
        Shape::Values => Receiver::Values,
        _ => return Err(unsupported()),
    };
    let signature = DISPATCH
        .iter()
        .find(|s| {
            s.method == method.name()
                && s.receivers.contains(&category)
                && s.arities.contains(&arity)
        })
        .ok_or_else(unsupported)?;

    let entity = match receiver {
        Shape::Collection(entity) | Shape::Sequence(entity) => Some(entity.clone()),
        _ => None,
    };

    let shape = match signature.yields {
        Yields::Filtered => entity.map(Shape::Sequence).unwrap_or(Shape::Values),
        Yields::Materialized => entity.map(Shape::Collection).unwrap_or(Shape::Values),
        Yields::Element => entity.map(Shape::Entity).unwrap_or(Shape::Scalar),
        Yields::Scalar => Shape::Scalar,
        Yields::Projected => match projection {
            Some(Shape::Entity(target)) => Shape::Sequence(target.clone()),
            Some(_) => Shape::Values,
            None => return Err(unsupported()),
        },
        Yields::Flattened => match projection {
            Some(Shape::Collection(target) | Shape::Sequence(target)) => {
                Shape::Sequence(target.clone())
            }
            Some(Shape::Values) => Shape::Values,
            _ => return Err(unsupported()),
        },
        Yields::Narrowed => match method {
            Method::OfType(target) => Shape::Sequence(target.clone()),
            _ => return Err(unsupported()),
        },
    };
    Ok(shape)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folders() -> Shape {
        Shape::Collection("Folder".into())
    }

    #[test]
    fn test_filtering_yields_sequence() {
        let shape = resolve_call(&Method::Where, &folders(), 1, None).unwrap();
        assert_eq!(shape, Shape::Sequence("Folder".into()));
        let again = resolve_call(&Method::Where, &shape, 1, None).unwrap();
        assert_eq!(again, shape);
    }

    #[test]
    fn test_to_list_materializes() {
        let filtered = Shape::Sequence("Folder".into());
        let shape = resolve_call(&Method::ToList, &filtered, 0, None).unwrap();
        assert_eq!(shape, folders());
    }

    #[test]
    fn test_scalar_results() {
        for method in [Method::Any, Method::Count] {
            assert_eq!(resolve_call(&method, &folders(), 0, None).unwrap(), Shape::Scalar);
        }
        assert_eq!(
            resolve_call(&Method::First, &folders(), 0, None).unwrap(),
            Shape::Entity("Folder".into())
        );
        assert_eq!(
            resolve_call(&Method::FirstOrDefault, &Shape::Values, 0, None).unwrap(),
            Shape::Scalar
        );
    }

    #[test]
    fn test_projection_shapes() {
        let entity = Shape::Entity("Item".into());
        assert_eq!(
            resolve_call(&Method::Select, &folders(), 1, Some(&entity)).unwrap(),
            Shape::Sequence("Item".into())
        );
        assert_eq!(
            resolve_call(&Method::Select, &folders(), 1, Some(&Shape::Scalar)).unwrap(),
            Shape::Values
        );
        let items = Shape::Sequence("Item".into());
        assert_eq!(
            resolve_call(&Method::SelectMany, &folders(), 1, Some(&items)).unwrap(),
            items
        );
        assert!(resolve_call(&Method::SelectMany, &folders(), 1, Some(&Shape::Scalar)).is_err());
    }

    #[test]
    fn test_of_type_needs_entities() {
        let method = Method::OfType("Invoice".into());
        assert_eq!(
            resolve_call(&method, &Shape::Collection("Document".into()), 0, None).unwrap(),
            Shape::Sequence("Invoice".into())
        );
        assert!(resolve_call(&method, &Shape::Values, 0, None).is_err());
    }

    #[test]
    fn test_unknown_combinations_are_unsupported() {
        let err = resolve_call(&Method::Where, &Shape::Scalar, 1, None).unwrap_err();
        assert!(matches!(err, SecurityError::UnsupportedShape(_)));
        assert!(resolve_call(&Method::Where, &folders(), 0, None).is_err());
        assert!(resolve_call(&Method::Any, &Shape::Entity("Folder".into()), 0, None).is_err());
        assert!(resolve_call(&Method::ToList, &folders(), 1, None).is_err());
    }

    #[test]
    fn test_element_shapes() {
        assert_eq!(folders().element(), Some(Shape::Entity("Folder".into())));
        assert_eq!(Shape::Values.element(), Some(Shape::Scalar));
        assert_eq!(Shape::Scalar.element(), None);
        let record = Shape::Record(vec![("Kids".into(), folders())]);
        assert_eq!(record.field("Kids"), folders());
        assert_eq!(record.field("Other"), Shape::Scalar);
    }
}
