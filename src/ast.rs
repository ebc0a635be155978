// Abstract Syntax Tree definitions

use crate::value::Value;

/// Expression tree node.
///
/// Every accepted source form lowers to one of these variants. Sub-nodes are
/// owned by their parent; the tree is immutable after parsing and is walked
/// directly by the evaluator.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal value (number, string, boolean, null)
    Literal(Value),

    /// Identifier lookup (variable, or function reference)
    Variable(String),

    /// Unary operation
    Unary { op: UnaryOp, operand: Box<Expr> },

    /// Binary operation
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },

    /// Conditional expression (? :)
    Ternary {
        condition: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },

    /// `value between low and high` / `value not between low and high`
    Between {
        value: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },

    /// Array constructor
    ArrayLiteral(Vec<Expr>),

    /// Map constructor: `{key: value, ...}` (keys evaluate to strings)
    MapLiteral(Vec<(Expr, Expr)>),

    /// List comprehension: `[body | var in source]` with optional condition
    Comprehension {
        body: Box<Expr>,
        variable: String,
        source: Box<Expr>,
        condition: Option<Box<Expr>>,
    },

    /// Free function call: `name(args...)`
    Call { name: String, args: Vec<Expr> },

    /// Method call on a receiver: `receiver.method(args...)`
    MethodCall {
        receiver: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },

    /// Field access: `receiver.name`
    FieldAccess { receiver: Box<Expr>, field: String },

    /// Index access: `receiver[index]`
    IndexAccess {
        receiver: Box<Expr>,
        index: Box<Expr>,
    },

    /// Collection macro: `receiver.kind(var, body)`
    ///
    /// `variable`/`body` are absent for the nullary kinds (`size`, `reverse`).
    Macro {
        receiver: Box<Expr>,
        kind: MacroKind,
        variable: Option<String>,
        body: Option<Box<Expr>>,
    },
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    // Arithmetic
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Power,

    // Comparison
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,

    // Logical (short-circuit)
    And,
    Or,

    // Membership
    In,
    NotIn,

    // SQL-style pattern match (% / _)
    Like,
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Arithmetic negation (-)
    Negate,

    /// Logical NOT (!)
    Not,
}

/// Collection macro kinds, in the order they appear in the method-name table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroKind {
    Filter,
    Map,
    FlatMap,
    All,
    Exists,
    Find,
    Sort,
    GroupBy,
    Size,
    Reverse,
}

impl MacroKind {
    /// Resolve a method name to a macro kind, if it is one.
    pub fn from_name(name: &str) -> Option<MacroKind> {
        match name {
            "filter" => Some(MacroKind::Filter),
            "map" => Some(MacroKind::Map),
            "flatMap" => Some(MacroKind::FlatMap),
            "all" => Some(MacroKind::All),
            "exists" => Some(MacroKind::Exists),
            "find" => Some(MacroKind::Find),
            "sort" => Some(MacroKind::Sort),
            "groupBy" => Some(MacroKind::GroupBy),
            "size" => Some(MacroKind::Size),
            "reverse" => Some(MacroKind::Reverse),
            _ => None,
        }
    }

    /// Kinds that take no bound variable and no body.
    pub fn is_nullary(self) -> bool {
        matches!(self, MacroKind::Size | MacroKind::Reverse)
    }

    pub fn name(self) -> &'static str {
        match self {
            MacroKind::Filter => "filter",
            MacroKind::Map => "map",
            MacroKind::FlatMap => "flatMap",
            MacroKind::All => "all",
            MacroKind::Exists => "exists",
            MacroKind::Find => "find",
            MacroKind::Sort => "sort",
            MacroKind::GroupBy => "groupBy",
            MacroKind::Size => "size",
            MacroKind::Reverse => "reverse",
        }
    }
}

impl Expr {
    /// Create a literal node
    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    /// Create a null literal node
    pub fn null() -> Self {
        Expr::Literal(Value::Null)
    }

    /// Create an identifier node
    pub fn variable(name: impl Into<String>) -> Self {
        Expr::Variable(name.into())
    }

    /// Create a binary operation node
    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Create a unary operation node
    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        Expr::Unary {
            op,
            operand: Box::new(operand),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_creation() {
        let lit = Expr::literal(42i64);
        assert_eq!(lit, Expr::Literal(Value::Int(42)));

        let var = Expr::variable("x");
        assert!(matches!(var, Expr::Variable(_)));

        let bin = Expr::binary(BinaryOp::Add, Expr::literal(1i64), Expr::literal(2i64));
        assert!(matches!(bin, Expr::Binary { op: BinaryOp::Add, .. }));
    }

    #[test]
    fn test_macro_kind_table() {
        assert_eq!(MacroKind::from_name("filter"), Some(MacroKind::Filter));
        assert_eq!(MacroKind::from_name("flatMap"), Some(MacroKind::FlatMap));
        assert_eq!(MacroKind::from_name("groupBy"), Some(MacroKind::GroupBy));
        assert_eq!(MacroKind::from_name("join"), None);

        assert!(MacroKind::Size.is_nullary());
        assert!(MacroKind::Reverse.is_nullary());
        assert!(!MacroKind::Filter.is_nullary());
    }
}
