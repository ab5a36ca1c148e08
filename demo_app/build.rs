// Compiles the Vulkan shaders under shaders/vulkan to SPIR-V in OUT_DIR.
// The OpenGL shaders are GLSL text embedded by the binary and need no step here.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

const STAGES: [&str; 3] = ["vert", "frag", "comp"];

fn compile_shaders(shader_dir: &Path, out_dir: &Path, glslc: &Path) -> usize {
    let entries = match std::fs::read_dir(shader_dir) {
        Ok(entries) => entries,
        Err(_) => {
            eprintln!("info: No shader directory found at: {shader_dir:?}");
            return 0;
        }
    };

    let mut compiled = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else { continue };
        if !STAGES.contains(&ext) {
            continue;
        }
        let Some(name) = path.file_name() else { continue };
        // quad.vert -> quad.vert.spv keeps stages of one shader apart
        let out_file = out_dir.join(name).with_extension(format!("{ext}.spv"));

        let status = Command::new(glslc).arg(&path).arg("-o").arg(&out_file).status();
        match status {
            Ok(s) if s.success() => {
                eprintln!("info: Compiled {name:?}");
                compiled += 1;
            }
            Ok(s) => panic!("glslc failed for {path:?} with exit code {}", s.code().unwrap_or(-1)),
            Err(e) => panic!("Failed to run glslc for {path:?}: {e}"),
        }
    }
    compiled
}

fn main() {
    println!("cargo:rerun-if-changed=shaders/vulkan");
    println!("cargo:rerun-if-env-changed=VULKAN_SDK");
    println!("cargo:rerun-if-env-changed=SKIP_SHADERS");

    if env::var("SKIP_SHADERS").is_ok() {
        eprintln!("info: Skipping shader compilation (SKIP_SHADERS set)");
        return;
    }

    let Ok(vulkan_sdk) = env::var("VULKAN_SDK") else {
        eprintln!("warning: VULKAN_SDK not set, shader compilation skipped; the Vulkan path will not find its shaders");
        return;
    };
    let glslc = if cfg!(target_os = "windows") {
        PathBuf::from(&vulkan_sdk).join("Bin").join("glslc.exe")
    } else {
        PathBuf::from(&vulkan_sdk).join("bin").join("glslc")
    };
    if !glslc.exists() {
        eprintln!("warning: glslc not found at {glslc:?}, shader compilation skipped");
        return;
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("cargo sets OUT_DIR for build scripts"));
    let compiled = compile_shaders(Path::new("shaders/vulkan"), &out_dir, &glslc);
    eprintln!("info: Compiled {compiled} shader(s)");
}
