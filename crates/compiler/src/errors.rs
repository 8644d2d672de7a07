//! Compiler diagnostics.
//!
//! Every diagnostic carries a stable numeric code, the unit name and the
//! source position it was raised at. Two output grammars exist:
//!
//! - `default`: `Error N: <msg> in <name> (<col>,<line>)`
//! - `ms`:      `<name>(<line>): Error N: <msg>` (no column, to match a
//!   common IDE's jump-to-line parser)
//!
//! Warnings use the same grammar with their level in parentheses and are
//! filtered by the `warning-level` option before they are queued.

/// Output grammar selector, set by the `error-format` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorFormat {
    #[default]
    Default,
    Ms,
}

/// Stable error codes. The discriminant blocks group the classes from
/// the diagnostics design: 1xx lexical, 2xx syntactic, 3xx name/scope,
/// 4xx type, 5xx control flow, 6xx declarations/imports, 9xx fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    // Lexical.
    MalformedLiteral,
    UnterminatedString,
    UnexpectedCharacter,

    // Syntactic.
    UnexpectedToken,
    MissingSemicolon,
    MismatchedBrace,
    ExpectedIdentifier,
    UnexpectedEndOfFile,

    // Name and scope.
    UndefinedIdentifier,
    IdentifierAlreadyDefined,
    AmbiguousFunctionCall,
    UndefinedFunctionCall,
    NoSuitableDelegate,
    CallingMethodFromStatic,
    ErrorInFunctionArgument,

    // Types.
    IncompatibleType,
    ConstViolation,
    NoCopyConstructor,
    ConvertorRequiresCast,
    WeakWithoutRef,
    ArrayOfArray,
    NotInitialized,
    FamilyMismatch,

    // Control flow.
    BreakWithoutContext,
    ContinueWithoutContext,
    GotoWithoutContext,
    UnresolvedLabel,
    ReturnInCofunction,
    YieldOutsideCofunction,
    ReturnMissingValue,
    UninitializedMember,

    // Declarations and imports.
    PrototypeMismatch,
    FunctionAlreadyDefined,
    ClassWithoutConstructor,
    ImportNotFound,
    FileOpen,
    BadOption,
    VmFailure,

    // Fatal consistency errors.
    FatalTypeIdDesync,
    FatalStackUnderflow,
    FatalRegisterState,
    FatalInternal,
}

impl ErrorKind {
    pub fn code(self) -> u32 {
        match self {
            ErrorKind::MalformedLiteral => 101,
            ErrorKind::UnterminatedString => 102,
            ErrorKind::UnexpectedCharacter => 103,

            ErrorKind::UnexpectedToken => 201,
            ErrorKind::MissingSemicolon => 202,
            ErrorKind::MismatchedBrace => 203,
            ErrorKind::ExpectedIdentifier => 204,
            ErrorKind::UnexpectedEndOfFile => 205,

            ErrorKind::UndefinedIdentifier => 301,
            ErrorKind::IdentifierAlreadyDefined => 302,
            ErrorKind::AmbiguousFunctionCall => 303,
            ErrorKind::UndefinedFunctionCall => 304,
            ErrorKind::NoSuitableDelegate => 305,
            ErrorKind::CallingMethodFromStatic => 306,
            ErrorKind::ErrorInFunctionArgument => 307,

            ErrorKind::IncompatibleType => 401,
            ErrorKind::ConstViolation => 402,
            ErrorKind::NoCopyConstructor => 403,
            ErrorKind::ConvertorRequiresCast => 404,
            ErrorKind::WeakWithoutRef => 405,
            ErrorKind::ArrayOfArray => 406,
            ErrorKind::NotInitialized => 407,
            ErrorKind::FamilyMismatch => 408,

            ErrorKind::BreakWithoutContext => 501,
            ErrorKind::ContinueWithoutContext => 502,
            ErrorKind::GotoWithoutContext => 503,
            ErrorKind::UnresolvedLabel => 504,
            ErrorKind::ReturnInCofunction => 505,
            ErrorKind::YieldOutsideCofunction => 506,
            ErrorKind::ReturnMissingValue => 507,
            ErrorKind::UninitializedMember => 508,

            ErrorKind::PrototypeMismatch => 601,
            ErrorKind::FunctionAlreadyDefined => 602,
            ErrorKind::ClassWithoutConstructor => 603,
            ErrorKind::ImportNotFound => 604,
            ErrorKind::FileOpen => 605,
            ErrorKind::BadOption => 606,
            ErrorKind::VmFailure => 607,

            ErrorKind::FatalTypeIdDesync => 901,
            ErrorKind::FatalStackUnderflow => 902,
            ErrorKind::FatalRegisterState => 903,
            ErrorKind::FatalInternal => 904,
        }
    }

    /// The overload-resolver probe path tolerates these: they mean "this
    /// candidate does not fit", not "abort the enclosing expression".
    pub fn is_tolerated(self) -> bool {
        matches!(
            self,
            ErrorKind::UndefinedFunctionCall
                | ErrorKind::UndefinedIdentifier
                | ErrorKind::ErrorInFunctionArgument
        )
    }

    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::FatalTypeIdDesync
                | ErrorKind::FatalStackUnderflow
                | ErrorKind::FatalRegisterState
                | ErrorKind::FatalInternal
        )
    }
}

/// Warning codes, sharing the message grammar with errors. The level is
/// compared against the `warning-level` option (0 silences everything).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    UnreachableCode,
    LocalHidesGlobal,
    AssignWeakRefTemp,
    DynamicConversion,
    PrecisionLoss,
    DiscardedReturnValue,
}

impl WarningKind {
    pub fn code(self) -> u32 {
        match self {
            WarningKind::UnreachableCode => 701,
            WarningKind::LocalHidesGlobal => 702,
            WarningKind::AssignWeakRefTemp => 703,
            WarningKind::DynamicConversion => 704,
            WarningKind::PrecisionLoss => 705,
            WarningKind::DiscardedReturnValue => 706,
        }
    }

    /// Minimum `warning-level` at which this warning is reported.
    pub fn level(self) -> u32 {
        match self {
            WarningKind::UnreachableCode => 1,
            WarningKind::AssignWeakRefTemp => 1,
            WarningKind::LocalHidesGlobal => 2,
            WarningKind::PrecisionLoss => 3,
            WarningKind::DynamicConversion => 4,
            WarningKind::DiscardedReturnValue => 4,
        }
    }
}

/// A formatted diagnostic with its source position.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub kind: ErrorKind,
    pub message: String,
    pub unit: String,
    /// 1-indexed.
    pub line: usize,
    /// 1-indexed.
    pub column: usize,
}

impl CompileError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        CompileError {
            kind,
            message: message.into(),
            unit: String::new(),
            line: 0,
            column: 0,
        }
    }

    pub fn at(mut self, unit: &str, line: usize, column: usize) -> Self {
        self.unit = unit.to_string();
        self.line = line;
        self.column = column;
        self
    }

    /// Render in the given grammar.
    pub fn format(&self, format: ErrorFormat) -> String {
        match format {
            ErrorFormat::Default => format!(
                "Error {}: {} in {} ({},{})",
                self.kind.code(),
                self.message,
                self.unit,
                self.column,
                self.line
            ),
            ErrorFormat::Ms => format!(
                "{}({}): Error {}: {}",
                self.unit,
                self.line,
                self.kind.code(),
                self.message
            ),
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.format(ErrorFormat::Default))
    }
}

impl std::error::Error for CompileError {}

/// Render a warning in the given grammar.
pub fn format_warning(
    kind: WarningKind,
    message: &str,
    unit: &str,
    line: usize,
    column: usize,
    format: ErrorFormat,
) -> String {
    match format {
        ErrorFormat::Default => format!(
            "Warning {} ({}): {} in {} ({},{})",
            kind.code(),
            kind.level(),
            message,
            unit,
            column,
            line
        ),
        ErrorFormat::Ms => format!(
            "{}({}): Warning {} ({}): {}",
            unit,
            line,
            kind.code(),
            kind.level(),
            message
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_format() {
        let err = CompileError::new(ErrorKind::UndefinedIdentifier, "undefined identifier 'foo'")
            .at("main.ql", 12, 5);
        assert_eq!(
            err.format(ErrorFormat::Default),
            "Error 301: undefined identifier 'foo' in main.ql (5,12)"
        );
    }

    #[test]
    fn test_ms_format_omits_column() {
        let err = CompileError::new(ErrorKind::MissingSemicolon, "missing ';'").at("a.ql", 3, 17);
        assert_eq!(err.format(ErrorFormat::Ms), "a.ql(3): Error 202: missing ';'");
    }

    #[test]
    fn test_tolerated_set() {
        assert!(ErrorKind::UndefinedFunctionCall.is_tolerated());
        assert!(ErrorKind::UndefinedIdentifier.is_tolerated());
        assert!(ErrorKind::ErrorInFunctionArgument.is_tolerated());
        assert!(!ErrorKind::IncompatibleType.is_tolerated());
        assert!(!ErrorKind::FatalStackUnderflow.is_tolerated());
    }

    #[test]
    fn test_warning_format() {
        let s = format_warning(
            WarningKind::PrecisionLoss,
            "implicit conversion may lose precision",
            "m.ql",
            4,
            9,
            ErrorFormat::Default,
        );
        assert_eq!(
            s,
            "Warning 705 (3): implicit conversion may lose precision in m.ql (9,4)"
        );
    }
}
