//! Stable diagnostic codes
//!
//! Grouped the way spec.md §7 groups error kinds: lexical, compile,
//! runtime, system. Codes are stable identifiers other tooling (editors,
//! golden tests) can match on without parsing the message text.

// Lexical (surfaced by the lexer; the "preprocessor" of spec.md §1)
pub const UNTERMINATED_STRING: &str = "TL0001";
pub const UNEXPECTED_CHARACTER: &str = "TL0002";
pub const INVALID_NUMBER: &str = "TL0003";

// Compile
pub const UNEXPECTED_TOKEN: &str = "TL0100";
pub const DUPLICATE_MODULE_ALIAS: &str = "TL0101";
pub const DUPLICATE_EXPORT: &str = "TL0102";
pub const AMBIGUOUS_IMPORT: &str = "TL0103";
pub const UNDEFINED_VARIABLE: &str = "TL0104";
pub const ASSIGN_UNDECLARED: &str = "TL0105";
pub const TOO_MANY_CONSTANTS: &str = "TL0106";
pub const TOO_MANY_LOCALS: &str = "TL0107";
pub const TOO_MANY_UPVALUES: &str = "TL0108";
pub const JUMP_TOO_LARGE: &str = "TL0109";
pub const INVALID_BREAK: &str = "TL0110";
pub const INVALID_CONTINUE: &str = "TL0111";
pub const INVALID_ADVANCE: &str = "TL0112";
pub const RETURN_OUTSIDE_FUNCTION: &str = "TL0113";
pub const RETURN_VALUE_IN_CONSTRUCTOR: &str = "TL0114";
pub const SELF_INHERITANCE: &str = "TL0115";
pub const DUPLICATE_DEFAULT: &str = "TL0116";
pub const LOCAL_USED_BEFORE_INIT: &str = "TL0117";
pub const MODULE_CYCLE: &str = "TL0118";

// Runtime
pub const TYPE_MISMATCH: &str = "TL0200";
pub const ARITY_MISMATCH: &str = "TL0201";
pub const NOT_CALLABLE: &str = "TL0202";
pub const NOT_INDEXABLE: &str = "TL0203";
pub const NON_INTEGER_OPERAND: &str = "TL0204";
pub const INDEX_OUT_OF_BOUNDS: &str = "TL0205";
pub const UNDEFINED_GLOBAL: &str = "TL0206";
pub const UNDEFINED_FIELD: &str = "TL0207";
pub const UNDEFINED_METHOD: &str = "TL0208";
pub const STACK_OVERFLOW: &str = "TL0209";
pub const SUPERCLASS_NOT_CLASS: &str = "TL0210";
pub const CONSTRUCTOR_ARITY: &str = "TL0211";

// System
pub const FILE_NOT_FOUND: &str = "TL0300";
pub const IO_FAILURE: &str = "TL0301";
pub const ALLOCATION_FAILURE: &str = "TL0302";
