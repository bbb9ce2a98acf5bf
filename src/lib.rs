pub mod chunk;
pub mod compiler;
pub mod heap;
pub mod natives;
pub mod reporter;
pub mod table;
pub mod token;
pub mod tokenizer;
pub mod value;
pub mod vm;

pub use heap::{Heap, ObjRef};
pub use reporter::{CliReporter, Phase, Report, Reporter};
pub use value::{NativeFn, Value};
pub use vm::{InterpretError, Vm};

#[cfg(test)]
mod tests {
    use super::*;

    struct CollectingReporter {
        reports: Vec<Report>,
    }

    impl Reporter for CollectingReporter {
        fn report(&mut self, report: Report) {
            self.reports.push(report);
        }
    }

    #[test]
    fn embedding_a_native_makes_it_callable_from_script() {
        fn double(args: &[Value]) -> Result<Value, String> {
            match args {
                [Value::Number(n)] => Ok(Value::Number(n * 2.0)),
                _ => Err("Expected 1 argument but got a different number.".to_string()),
            }
        }

        let mut vm = Vm::new();
        vm.define_native("double", 1, double);
        let mut reporter = CollectingReporter { reports: Vec::new() };
        let result = vm.interpret("print double(21);", &mut reporter);
        assert!(result.is_ok());
    }

    #[test]
    fn a_compile_error_is_reported_and_does_not_panic() {
        let mut vm = Vm::new();
        let mut reporter = CollectingReporter { reports: Vec::new() };
        let result = vm.interpret("var = ;", &mut reporter);
        assert_eq!(result, Err(InterpretError::Compile));
        assert!(!reporter.reports.is_empty());
    }
}
