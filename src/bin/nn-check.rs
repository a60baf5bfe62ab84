//! Checks that the interpreter and the compiled code agree on a model.
//!
//! Every node is compiled on its own and compared against the interpreter
//! on random inputs, then the whole network is compiled and compared.

use std::process;

use rand::{Rng, SeedableRng};

use compiled_nn::codegen::{CompilationSettings, CompiledNN};
use compiled_nn::model::{LayerKind, Model};
use compiled_nn::{interp, Tensor};

fn usage(program: &str) -> ! {
    eprintln!("Usage: {program} <path to model> [<min input> [<max input>]]");
    process::exit(1);
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("nn-check");
    if args.len() < 2 || args.len() > 4 {
        usage(program);
    }
    let model = Model::load(&args[1]).unwrap_or_else(|err| {
        eprintln!("Error loading model: {err}");
        process::exit(1);
    });

    let min_input: f32 = args.get(2).map_or(-1.0, |v| v.parse().unwrap_or(-1.0));
    let max_input: f32 = args.get(3).map_or(1.0, |v| v.parse().unwrap_or(1.0));

    // A deterministic seed is okay here.
    let mut generator = rand::rngs::StdRng::seed_from_u64(0);

    let mut test_inputs = Vec::with_capacity(model.inputs.len());
    for &loc in &model.inputs {
        let dims = model.output_dimensions(loc).expect("resolved input").to_vec();
        let mut tensor = Tensor::new(dims);
        for v in tensor.data_mut() {
            *v = generator.gen_range(min_input..=max_input);
        }
        test_inputs.push(tensor);
    }

    let settings = CompilationSettings {
        use_exp_approx_in_sigmoid: false,
        use_exp_approx_in_tanh: false,
        debug: true,
        ..CompilationSettings::default()
    };

    // Compare each node on its own against the interpreter.
    let mut check_node = |node: compiled_nn::model::NodeRef,
                          inputs: &[&Tensor],
                          outputs: &[Tensor]| {
        let kind = &model.layers[node.layer].kind;
        if matches!(kind, LayerKind::Input { .. }) {
            return;
        }
        print!("{}: ", kind.name());
        let mut nn = match CompiledNN::compile_node(&model, node, &settings) {
            Ok(nn) => nn,
            Err(err) => {
                println!("not compiled ({err})");
                return;
            }
        };
        assert_eq!(inputs.len(), nn.num_of_inputs());
        assert_eq!(outputs.len(), nn.num_of_outputs());
        for (i, input) in inputs.iter().enumerate() {
            nn.input(i).copy_from(input);
        }
        nn.apply();
        for (i, expected) in outputs.iter().enumerate() {
            print!(
                "rel {:e}, abs {:e}  ",
                expected.max_rel_error(nn.output(i).data()),
                expected.max_abs_error(nn.output(i).data())
            );
        }
        println!();
    };
    let expected = interp::apply_with_callback(&model, &test_inputs, Some(&mut check_node))
        .unwrap_or_else(|err| {
            eprintln!("Error running the interpreter: {err}");
            process::exit(1);
        });

    // Compare the whole network.
    let mut nn = CompiledNN::compile(&model, &settings).unwrap_or_else(|err| {
        eprintln!("Error compiling: {err}");
        process::exit(1);
    });
    assert_eq!(nn.num_of_inputs(), test_inputs.len());
    for (i, input) in test_inputs.iter().enumerate() {
        nn.input(i).copy_from(input);
    }
    nn.apply();
    assert_eq!(nn.num_of_outputs(), expected.len());
    print!("Total: ");
    for (i, tensor) in expected.iter().enumerate() {
        print!(
            "rel {:e}, abs {:e}  ",
            tensor.max_rel_error(nn.output(i).data()),
            tensor.max_abs_error(nn.output(i).data())
        );
    }
    println!();
}
