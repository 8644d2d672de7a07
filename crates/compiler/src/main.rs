//! Quill Compiler CLI
//!
//! Command-line interface for compiling .ql modules into a program
//! image, checking sources and dumping the type registry.

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{Shell, generate};
use std::io;
use std::path::{Path, PathBuf};
use std::process;

use quill_core::ImageVm;
use quillc::{Compiler, ProjectConfig};

#[derive(ClapParser)]
#[command(name = "quillc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Quill compiler - compile .ql modules to a VM image", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile .ql modules and write the linked program image
    Build {
        /// Input .ql source files, compiled in order
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Output image path (defaults to the first input with .qimg)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Compiler options as key=value lists (repeatable)
        #[arg(short = 'O', long = "option", value_name = "LIST")]
        options: Vec<String>,

        /// Project configuration file (defaults to ./quill.toml if present)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Compile and link without writing an image
    Check {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        #[arg(short = 'O', long = "option", value_name = "LIST")]
        options: Vec<String>,

        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Compile modules and dump the type registry as XML
    DumpTypes {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Output path; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .without_time()
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Build {
            inputs,
            output,
            options,
            config,
        } => {
            let output = output.unwrap_or_else(|| {
                let mut path = inputs[0].clone();
                path.set_extension("qimg");
                path
            });
            run_build(&inputs, Some(&output), &options, config.as_deref());
        }
        Commands::Check {
            inputs,
            options,
            config,
        } => {
            run_build(&inputs, None, &options, config.as_deref());
        }
        Commands::DumpTypes { inputs, output } => {
            run_dump_types(&inputs, output.as_deref());
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "quillc", &mut io::stdout());
        }
    }
}

/// Build a compiler, apply project config and option lists, compile
/// every input and link. Exits the process on failure.
fn new_compiler(options: &[String], config: Option<&Path>) -> Compiler {
    let mut compiler = match Compiler::new(Box::new(ImageVm::new()), "verbose=on") {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    // Project config: an explicit path, or ./quill.toml when present.
    let config_path = config
        .map(Path::to_path_buf)
        .or_else(|| {
            let default = PathBuf::from("quill.toml");
            default.exists().then_some(default)
        });
    if let Some(path) = config_path {
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                eprintln!("cannot read {}: {}", path.display(), e);
                process::exit(1);
            }
        };
        let project = match ProjectConfig::parse(&text) {
            Ok(project) => project,
            Err(e) => {
                eprintln!("{}", e);
                process::exit(1);
            }
        };
        if let Some(list) = &project.options {
            if let Err(e) = compiler.set_options(list) {
                eprintln!("{}", e);
                process::exit(1);
            }
        }
        for entry in &project.import_paths {
            compiler.add_import_path(&entry.name, &entry.path);
        }
    }

    for list in options {
        if let Err(e) = compiler.set_options(list) {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
    compiler
}

fn compile_inputs(compiler: &mut Compiler, inputs: &[PathBuf]) -> bool {
    let mut ok = true;
    for input in inputs {
        if compiler.compile_file(input).is_err() {
            ok = false;
        }
    }
    ok
}

fn drain_messages(compiler: &mut Compiler) {
    while let Some(message) = compiler.error_text() {
        eprintln!("{}", message);
    }
}

fn run_build(
    inputs: &[PathBuf],
    output: Option<&Path>,
    options: &[String],
    config: Option<&Path>,
) {
    let mut compiler = new_compiler(options, config);
    let compiled = compile_inputs(&mut compiler, inputs);
    let image = if compiled { compiler.link().ok() } else { None };
    drain_messages(&mut compiler);
    let Some(image) = image else {
        process::exit(1);
    };

    if let Some(output) = output {
        let bytes = match bincode::serialize(&image) {
            Ok(bytes) => bytes,
            Err(e) => {
                eprintln!("cannot serialize image: {}", e);
                process::exit(1);
            }
        };
        if let Err(e) = std::fs::write(output, bytes) {
            eprintln!("cannot write {}: {}", output.display(), e);
            process::exit(1);
        }
        println!("wrote {}", output.display());
    }
}

fn run_dump_types(inputs: &[PathBuf], output: Option<&Path>) {
    let mut compiler = new_compiler(&[], None);
    let ok = compile_inputs(&mut compiler, inputs);
    drain_messages(&mut compiler);
    if !ok {
        process::exit(1);
    }
    let xml = compiler.type_info_xml();
    match output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, xml) {
                eprintln!("cannot write {}: {}", path.display(), e);
                process::exit(1);
            }
        }
        None => print!("{}", xml),
    }
}
