use kiln::scheduler::{
    CompileDiagnostic, CompileInput, CompileOutput, CompileTarget, CompilerBackend,
    CompilerBackendRegistry, CompilerBackendRegistryBuilder,
};

pub const TOY_VERTEX_TARGET: CompileTarget = CompileTarget(1);
pub const TOY_FRAGMENT_TARGET: CompileTarget = CompileTarget(2);

/// "Compiles" a tiny shader language: one statement per line, braces must balance, and the
/// environment is substituted into `$NAME` tokens. The output is the statements with comments
/// stripped, prefixed by the entry point.
pub struct ToyShaderBackend;

impl ToyShaderBackend {
    fn expand(
        line: &str,
        environment: &[(String, String)],
    ) -> String {
        let mut line = line.to_string();
        for (name, value) in environment {
            line = line.replace(&format!("${}", name), value);
        }
        line
    }
}

impl CompilerBackend for ToyShaderBackend {
    fn name(&self) -> &str {
        "toy-shader"
    }

    fn targets(&self) -> Vec<CompileTarget> {
        vec![TOY_VERTEX_TARGET, TOY_FRAGMENT_TARGET]
    }

    fn compile(
        &self,
        input: &CompileInput,
    ) -> CompileOutput {
        let mut code = format!("entry {}\n", input.entry_point);
        let mut diagnostics = Vec::default();
        let mut depth = 0i32;
        let mut found_entry_point = false;

        for (index, line) in input.source.lines().enumerate() {
            let line = line.split("//").next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with(&format!("fn {}", input.entry_point)) {
                found_entry_point = true;
            }

            depth += line.matches('{').count() as i32;
            depth -= line.matches('}').count() as i32;
            if depth < 0 {
                diagnostics.push(CompileDiagnostic {
                    file: input.debug_name.clone(),
                    line: index as u32 + 1,
                    message: "unexpected '}'".to_string(),
                });
                depth = 0;
            }

            code.push_str(&Self::expand(line, &input.environment));
            code.push('\n');
        }

        if depth > 0 {
            diagnostics.push(CompileDiagnostic {
                file: input.debug_name.clone(),
                line: input.source.lines().count() as u32,
                message: format!("{} unclosed '{{'", depth),
            });
        }

        if !found_entry_point {
            diagnostics.push(CompileDiagnostic {
                file: input.debug_name.clone(),
                line: 0,
                message: format!("entry point '{}' not found", input.entry_point),
            });
        }

        CompileOutput {
            succeeded: diagnostics.is_empty(),
            code: if diagnostics.is_empty() {
                code.into_bytes()
            } else {
                Vec::default()
            },
            diagnostics,
        }
    }
}

pub fn backends() -> CompilerBackendRegistry {
    let mut builder = CompilerBackendRegistryBuilder::default();
    builder.register_backend(ToyShaderBackend);
    builder.build()
}
