//! Optional pre-pass that narrows the breakpoint set to source lines holding
//! assignment-like expressions over watchable symbols. Anything the walk cannot
//! prove harmless (a function call, an aliasing write) keeps its line:
//! under-approximation here would lose variable transitions.

use lang_c::ast::{
    BlockItem, Declaration, DeclarationSpecifier, Declarator, DeclaratorKind, DerivedDeclarator,
    Expression, ExternalDeclaration, ForInitializer, FunctionDefinition, Initializer, Statement,
    StorageClassSpecifier, TypeSpecifier, UnaryOperator,
};
use lang_c::driver::{parse, Config, Parse};
use lang_c::span::Node;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::rc::Rc;

/// Preprocessor knobs forwarded to the external C parser.
#[derive(Debug, Clone, Default)]
pub struct AnalysisConfig {
    pub includes: Vec<String>,
    pub defines: Vec<String>,
    pub undefines: Vec<String>,
    pub std: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("source file `{0}` is missing")]
    SourceMissing(String),
    #[error("source parsing failed: {0}")]
    Parse(String),
    #[error("function `{0}` not found in source")]
    FunctionNotFound(String),
}

/// Compute the set of source lines of `function` where a breakpoint must stay:
/// lines with assignment-like expressions over watchable symbols plus every
/// function call line.
pub fn assignment_lines(
    source: &Path,
    function: &str,
    config: &AnalysisConfig,
) -> Result<BTreeSet<u64>, AnalysisError> {
    if !source.exists() {
        return Err(AnalysisError::SourceMissing(
            source.to_string_lossy().to_string(),
        ));
    }

    let mut cpp = Config::default();
    for include in &config.includes {
        cpp.cpp_options.push(format!("-I{include}"));
    }
    for define in &config.defines {
        cpp.cpp_options.push(format!("-D{define}"));
    }
    for undefine in &config.undefines {
        cpp.cpp_options.push(format!("-U{undefine}"));
    }
    if let Some(ref std) = config.std {
        cpp.cpp_options.push(format!("-std={std}"));
    }

    let parse = parse(&cpp, source).map_err(|e| AnalysisError::Parse(format!("{e:?}")))?;
    let target_file = source
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();

    lines_of_parse(&parse, function, &target_file)
}

fn lines_of_parse(
    parse: &Parse,
    function: &str,
    target_file: &str,
) -> Result<BTreeSet<u64>, AnalysisError> {
    let line_map = LineMap::new(&parse.source);

    let mut symbols = SymbolTable::default();
    let mut target = None;
    for ext in &parse.unit.0 {
        match ext.node {
            ExternalDeclaration::Declaration(ref decl) => symbols.add_file_scope(&decl.node),
            ExternalDeclaration::FunctionDefinition(ref fd) => {
                if declarator_name(&fd.node.declarator.node) == Some(function) {
                    target = Some(fd);
                }
            }
            ExternalDeclaration::StaticAssert(_) => {}
        }
    }
    let target = target.ok_or_else(|| AnalysisError::FunctionNotFound(function.to_string()))?;

    symbols.add_function_scope(&target.node);

    let mut walker = FnWalker {
        line_map: &line_map,
        target_file,
        symbols: &symbols,
        lines: BTreeSet::new(),
    };
    walker.walk_statement(&target.node.statement, true);

    Ok(walker.lines)
}

// ---------------------------------------------------------------------------------------------
// symbol classification
// ---------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SymbolShape {
    Scalar,
    Pointer,
    Array,
    Aggregate,
    Function,
    Unknown,
}

impl SymbolShape {
    fn watchable(self) -> bool {
        matches!(
            self,
            SymbolShape::Scalar | SymbolShape::Pointer | SymbolShape::Array
        )
    }
}

/// Names visible to the traced function: file-scope symbols, typedef shapes,
/// parameters and top-level locals.
#[derive(Default)]
struct SymbolTable {
    typedefs: HashMap<String, SymbolShape>,
    globals: HashMap<String, SymbolShape>,
    locals: HashMap<String, SymbolShape>,
}

impl SymbolTable {
    fn watchable(&self, name: &str) -> bool {
        self.locals
            .get(name)
            .or_else(|| self.globals.get(name))
            .is_some_and(|shape| shape.watchable())
    }

    fn base_shape(&self, specifiers: &[Node<DeclarationSpecifier>]) -> SymbolShape {
        for spec in specifiers {
            let DeclarationSpecifier::TypeSpecifier(ref ts) = spec.node else {
                continue;
            };
            return match ts.node {
                TypeSpecifier::Char
                | TypeSpecifier::Short
                | TypeSpecifier::Int
                | TypeSpecifier::Long
                | TypeSpecifier::Float
                | TypeSpecifier::Double
                | TypeSpecifier::Signed
                | TypeSpecifier::Unsigned
                | TypeSpecifier::Bool
                | TypeSpecifier::Enum(_) => SymbolShape::Scalar,
                TypeSpecifier::Struct(_) => SymbolShape::Aggregate,
                TypeSpecifier::TypedefName(ref id) => self
                    .typedefs
                    .get(&id.node.name)
                    .copied()
                    .unwrap_or(SymbolShape::Unknown),
                _ => SymbolShape::Unknown,
            };
        }
        SymbolShape::Unknown
    }

    fn declarator_shape(&self, base: SymbolShape, declarator: &Declarator) -> SymbolShape {
        let mut has_pointer = false;
        let mut has_array = false;
        let mut has_function = false;
        collect_derived(declarator, &mut has_pointer, &mut has_array, &mut has_function);

        if has_function {
            return if has_pointer {
                SymbolShape::Pointer
            } else {
                SymbolShape::Function
            };
        }
        if has_array {
            // an array is watchable when its elements are scalar-like
            return if has_pointer || base == SymbolShape::Scalar {
                SymbolShape::Array
            } else {
                SymbolShape::Aggregate
            };
        }
        if has_pointer {
            return SymbolShape::Pointer;
        }
        base
    }

    fn add_declaration(&mut self, decl: &Declaration, into_locals: bool) {
        let is_typedef = decl.specifiers.iter().any(|spec| {
            matches!(
                spec.node,
                DeclarationSpecifier::StorageClass(ref sc)
                    if sc.node == StorageClassSpecifier::Typedef
            )
        });
        let base = self.base_shape(&decl.specifiers);

        for init_decl in &decl.declarators {
            let declarator = &init_decl.node.declarator.node;
            let Some(name) = declarator_name(declarator) else {
                continue;
            };
            let shape = self.declarator_shape(base, declarator);
            if is_typedef {
                self.typedefs.insert(name.to_string(), shape);
            } else if into_locals {
                self.locals.insert(name.to_string(), shape);
            } else {
                self.globals.insert(name.to_string(), shape);
            }
        }
    }

    fn add_file_scope(&mut self, decl: &Declaration) {
        self.add_declaration(decl, false);
    }

    /// Parameters and top-level body declarations of the traced function. Inner
    /// block scopes are excluded on purpose.
    fn add_function_scope(&mut self, fd: &FunctionDefinition) {
        for derived in &fd.declarator.node.derived {
            let DerivedDeclarator::Function(ref fn_decl) = derived.node else {
                continue;
            };
            for param in &fn_decl.node.parameters {
                let Some(ref declarator) = param.node.declarator else {
                    continue;
                };
                let Some(name) = declarator_name(&declarator.node) else {
                    continue;
                };
                let base = self.base_shape(&param.node.specifiers);
                let shape = self.declarator_shape(base, &declarator.node);
                self.locals.insert(name.to_string(), shape);
            }
        }
        // K&R style parameter declarations
        for decl in &fd.declarations {
            self.add_declaration(&decl.node, true);
        }

        if let Statement::Compound(ref items) = fd.statement.node {
            for item in items {
                if let BlockItem::Declaration(ref decl) = item.node {
                    self.add_declaration(&decl.node, true);
                }
            }
        }
    }
}

fn collect_derived(
    declarator: &Declarator,
    has_pointer: &mut bool,
    has_array: &mut bool,
    has_function: &mut bool,
) {
    for derived in &declarator.derived {
        match derived.node {
            DerivedDeclarator::Pointer(_) => *has_pointer = true,
            DerivedDeclarator::Array(_) => *has_array = true,
            DerivedDeclarator::Function(_) | DerivedDeclarator::KRFunction(_) => {
                *has_function = true
            }
            DerivedDeclarator::Block(_) => {}
        }
    }
    if let DeclaratorKind::Declarator(ref inner) = declarator.kind.node {
        collect_derived(&inner.node, has_pointer, has_array, has_function);
    }
}

fn declarator_name(declarator: &Declarator) -> Option<&str> {
    match declarator.kind.node {
        DeclaratorKind::Identifier(ref id) => Some(&id.node.name),
        DeclaratorKind::Declarator(ref inner) => declarator_name(&inner.node),
        DeclaratorKind::Abstract => None,
    }
}

// ---------------------------------------------------------------------------------------------
// statement walk
// ---------------------------------------------------------------------------------------------

struct FnWalker<'a> {
    line_map: &'a LineMap,
    target_file: &'a str,
    symbols: &'a SymbolTable,
    lines: BTreeSet<u64>,
}

impl FnWalker<'_> {
    fn record(&mut self, offset: usize) {
        let Some((file, line)) = self.line_map.lookup(offset) else {
            return;
        };
        // included code is outside the traced function line range
        let matches_target = file.is_empty()
            || Path::new(file.as_ref())
                .file_name()
                .is_some_and(|name| name.to_string_lossy() == self.target_file);
        if matches_target {
            self.lines.insert(line);
        }
    }

    fn walk_statement(&mut self, stmt: &Node<Statement>, top_level: bool) {
        match stmt.node {
            Statement::Compound(ref items) => {
                for item in items {
                    match item.node {
                        BlockItem::Declaration(ref decl) => {
                            self.walk_declaration(decl, top_level)
                        }
                        BlockItem::Statement(ref stmt) => self.walk_statement(stmt, false),
                        BlockItem::StaticAssert(_) => {}
                    }
                }
            }
            Statement::Labeled(ref labeled) => {
                self.walk_statement(&labeled.node.statement, false)
            }
            Statement::Expression(Some(ref expr)) => self.walk_expression(expr),
            Statement::Expression(None) => {}
            Statement::If(ref if_stmt) => {
                self.walk_expression(&if_stmt.node.condition);
                self.walk_statement(&if_stmt.node.then_statement, false);
                if let Some(ref else_stmt) = if_stmt.node.else_statement {
                    self.walk_statement(else_stmt, false);
                }
            }
            Statement::Switch(ref switch) => {
                self.walk_expression(&switch.node.expression);
                self.walk_statement(&switch.node.statement, false);
            }
            Statement::While(ref while_stmt) => {
                self.walk_expression(&while_stmt.node.expression);
                self.walk_statement(&while_stmt.node.statement, false);
            }
            Statement::DoWhile(ref do_while) => {
                self.walk_statement(&do_while.node.statement, false);
                self.walk_expression(&do_while.node.expression);
            }
            Statement::For(ref for_stmt) => {
                match for_stmt.node.initializer.node {
                    ForInitializer::Expression(ref expr) => self.walk_expression(expr),
                    ForInitializer::Declaration(ref decl) => self.walk_declaration(decl, false),
                    ForInitializer::Empty | ForInitializer::StaticAssert(_) => {}
                }
                if let Some(ref condition) = for_stmt.node.condition {
                    self.walk_expression(condition);
                }
                if let Some(ref step) = for_stmt.node.step {
                    self.walk_expression(step);
                }
                self.walk_statement(&for_stmt.node.statement, false);
            }
            Statement::Return(Some(ref expr)) => self.walk_expression(expr),
            Statement::Return(None)
            | Statement::Goto(_)
            | Statement::Continue
            | Statement::Break
            | Statement::Asm(_) => {}
        }
    }

    fn walk_declaration(&mut self, decl: &Node<Declaration>, top_level: bool) {
        for init_decl in &decl.node.declarators {
            let Some(ref initializer) = init_decl.node.initializer else {
                continue;
            };
            // only a top-level symbol initialisation is a watched transition, but
            // the initialiser may still carry nested assignments
            if top_level {
                let watchable = declarator_name(&init_decl.node.declarator.node)
                    .map(|name| self.symbols.watchable(name))
                    .unwrap_or(false);
                if watchable {
                    self.record(init_decl.span.start);
                }
            }
            self.walk_initializer(initializer);
        }
    }

    fn walk_initializer(&mut self, initializer: &Node<Initializer>) {
        match initializer.node {
            Initializer::Expression(ref expr) => self.walk_expression(expr),
            Initializer::List(ref items) => {
                for item in items {
                    self.walk_initializer(&item.node.initializer);
                }
            }
        }
    }

    fn walk_expression(&mut self, expr: &Node<Expression>) {
        match expr.node {
            Expression::BinaryOperator(ref binary) => {
                if is_assignment(&binary.node.operator.node) {
                    let mut symbols = vec![];
                    collect_leftmost(&binary.node.lhs, &mut symbols);
                    if symbols.iter().any(|name| self.symbols.watchable(name)) {
                        self.record(expr.span.start);
                    }
                }
                self.walk_expression(&binary.node.lhs);
                self.walk_expression(&binary.node.rhs);
            }
            Expression::UnaryOperator(ref unary) => {
                if is_mutating_unary(&unary.node.operator.node) {
                    let mut symbols = vec![];
                    collect_leftmost(&unary.node.operand, &mut symbols);
                    if symbols.iter().any(|name| self.symbols.watchable(name)) {
                        self.record(expr.span.start);
                    }
                }
                self.walk_expression(&unary.node.operand);
            }
            Expression::Call(ref call) => {
                // a call can mutate any visible variable through aliasing
                self.record(expr.span.start);
                self.walk_expression(&call.node.callee);
                for arg in &call.node.arguments {
                    self.walk_expression(arg);
                }
            }
            Expression::Cast(ref cast) => self.walk_expression(&cast.node.expression),
            Expression::Conditional(ref cond) => {
                self.walk_expression(&cond.node.condition);
                self.walk_expression(&cond.node.then_expression);
                self.walk_expression(&cond.node.else_expression);
            }
            Expression::Comma(ref exprs) => {
                for expr in exprs.iter() {
                    self.walk_expression(expr);
                }
            }
            Expression::Member(ref member) => self.walk_expression(&member.node.expression),
            Expression::Statement(ref stmt) => self.walk_statement(stmt, false),
            _ => {}
        }
    }
}

fn is_assignment(op: &lang_c::ast::BinaryOperator) -> bool {
    use lang_c::ast::BinaryOperator::*;
    matches!(
        op,
        Assign
            | AssignMultiply
            | AssignDivide
            | AssignModulo
            | AssignPlus
            | AssignMinus
            | AssignShiftLeft
            | AssignShiftRight
            | AssignBitwiseAnd
            | AssignBitwiseXor
            | AssignBitwiseOr
    )
}

fn is_mutating_unary(op: &UnaryOperator) -> bool {
    matches!(
        op,
        UnaryOperator::PreIncrement
            | UnaryOperator::PostIncrement
            | UnaryOperator::PreDecrement
            | UnaryOperator::PostDecrement
    )
}

/// Collect the left-most reachable symbols of an lvalue expression, descending
/// through casts, composites, dereferences and both arms of a conditional.
fn collect_leftmost<'e>(expr: &'e Node<Expression>, out: &mut Vec<&'e str>) {
    match expr.node {
        Expression::Identifier(ref id) => out.push(&id.node.name),
        Expression::Cast(ref cast) => collect_leftmost(&cast.node.expression, out),
        Expression::BinaryOperator(ref binary) => collect_leftmost(&binary.node.lhs, out),
        Expression::UnaryOperator(ref unary) => collect_leftmost(&unary.node.operand, out),
        Expression::Conditional(ref cond) => {
            collect_leftmost(&cond.node.then_expression, out);
            collect_leftmost(&cond.node.else_expression, out);
        }
        Expression::Comma(ref exprs) => {
            if let Some(first) = exprs.first() {
                collect_leftmost(first, out);
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------------------------
// preprocessed source line map
// ---------------------------------------------------------------------------------------------

/// Maps byte offsets of the preprocessed source back to (file, line) pairs by
/// tracking GNU `# linenum "file"` markers.
struct LineMap {
    entries: Vec<MapEntry>,
}

struct MapEntry {
    start: usize,
    file: Rc<str>,
    line: u64,
}

impl LineMap {
    fn new(source: &str) -> Self {
        let mut entries = vec![];
        let mut file: Rc<str> = Rc::from("");
        let mut line = 1u64;
        let mut offset = 0;

        for text in source.split_inclusive('\n') {
            if let Some((marker_line, marker_file)) = parse_line_marker(text) {
                line = marker_line;
                file = Rc::from(marker_file);
            } else {
                entries.push(MapEntry {
                    start: offset,
                    file: file.clone(),
                    line,
                });
                line += 1;
            }
            offset += text.len();
        }

        Self { entries }
    }

    fn lookup(&self, offset: usize) -> Option<(&Rc<str>, u64)> {
        let idx = self.entries.partition_point(|entry| entry.start <= offset);
        let entry = &self.entries[idx.checked_sub(1)?];
        Some((&entry.file, entry.line))
    }
}

/// Parse a `# linenum "file" flags...` (or `#line linenum "file"`) marker.
fn parse_line_marker(text: &str) -> Option<(u64, &str)> {
    let rest = text.strip_prefix('#')?;
    let rest = rest.strip_prefix("line").unwrap_or(rest);
    let rest = rest.trim_start_matches([' ', '\t']);
    let num_end = rest.find(|c: char| !c.is_ascii_digit())?;
    if num_end == 0 {
        return None;
    }
    let line = rest[..num_end].parse().ok()?;
    let rest = rest[num_end..].trim_start_matches([' ', '\t']);
    let file = rest.strip_prefix('"').and_then(|r| {
        let end = r.find('"')?;
        Some(&r[..end])
    });
    Some((line, file.unwrap_or("")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lang_c::driver::parse_preprocessed;

    #[test]
    fn test_line_marker_parsing() {
        assert_eq!(parse_line_marker("# 1 \"main.c\"\n"), Some((1, "main.c")));
        assert_eq!(
            parse_line_marker("# 42 \"/usr/include/stdio.h\" 1 3 4\n"),
            Some((42, "/usr/include/stdio.h"))
        );
        assert_eq!(parse_line_marker("#line 7 \"x.c\"\n"), Some((7, "x.c")));
        assert_eq!(parse_line_marker("int main() {\n"), None);
        assert_eq!(parse_line_marker("#pragma once\n"), None);
    }

    #[test]
    fn test_line_map_follows_markers() {
        let source = "# 1 \"main.c\"\nint a;\n# 10 \"other.h\"\nint b;\n# 3 \"main.c\"\nint c;\n";
        let map = LineMap::new(source);

        let a_offset = source.find("int a").expect("present");
        let b_offset = source.find("int b").expect("present");
        let c_offset = source.find("int c").expect("present");

        assert_eq!(
            map.lookup(a_offset).map(|(f, l)| (f.to_string(), l)),
            Some(("main.c".to_string(), 1))
        );
        assert_eq!(
            map.lookup(b_offset).map(|(f, l)| (f.to_string(), l)),
            Some(("other.h".to_string(), 10))
        );
        assert_eq!(
            map.lookup(c_offset).map(|(f, l)| (f.to_string(), l)),
            Some(("main.c".to_string(), 3))
        );
    }

    fn lines_of(source: &str, function: &str) -> BTreeSet<u64> {
        let parse =
            parse_preprocessed(&Config::default(), source.to_string()).expect("valid source");
        lines_of_parse(&parse, function, "").expect("function exists")
    }

    #[test]
    fn test_assignments_to_watchable_symbols_are_recorded() {
        let source = "\
int g;

void target(int n)
{
    int a;
    a = 1;
    g = n;
    n++;
    a;
}
";
        let lines = lines_of(source, "target");
        assert_eq!(lines, BTreeSet::from([6, 7, 8]));
    }

    #[test]
    fn test_calls_are_recorded_unconditionally() {
        let source = "\
void side(void);

void target(void)
{
    side();
}
";
        let lines = lines_of(source, "target");
        assert_eq!(lines, BTreeSet::from([5]));
    }

    #[test]
    fn test_declaration_with_initializer() {
        let source = "\
void target(void)
{
    int a = 3;
    int b;
    b = a;
}
";
        let lines = lines_of(source, "target");
        assert_eq!(lines, BTreeSet::from([3, 5]));
    }

    #[test]
    fn test_struct_member_writes_are_not_recorded() {
        let source = "\
struct point { int x; };

void target(void)
{
    struct point p;
    p.x = 1;
}
";
        let lines = lines_of(source, "target");
        assert!(lines.is_empty());
    }

    #[test]
    fn test_inner_block_locals_are_not_watchable() {
        let source = "\
void target(int n)
{
    if (n) {
        int inner;
        inner = 1;
        n = 2;
    }
}
";
        let lines = lines_of(source, "target");
        assert_eq!(lines, BTreeSet::from([6]));
    }

    #[test]
    fn test_array_and_pointer_lvalues() {
        let source = "\
void target(void)
{
    int arr[4];
    int *p;
    arr[0] = 1;
    p = arr;
    *p = 2;
}
";
        let lines = lines_of(source, "target");
        assert_eq!(lines, BTreeSet::from([5, 6, 7]));
    }

    #[test]
    fn test_typedef_to_scalar_is_watchable() {
        let source = "\
typedef unsigned long word_t;

void target(void)
{
    word_t w;
    w = 1;
}
";
        let lines = lines_of(source, "target");
        assert_eq!(lines, BTreeSet::from([6]));
    }
}
