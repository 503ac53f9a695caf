use std::fs;
use std::io::Write;
use std::path::Path;

/// 编译时把 migrations/*.sql 嵌入二进制，`migrate` 子命令按文件名顺序执行
fn main() {
    let migrations_dir = Path::new("migrations");
    let out_dir = std::env::var("OUT_DIR").expect("OUT_DIR 未设置");
    let dest_path = Path::new(&out_dir).join("migrations.rs");

    println!("cargo:rerun-if-changed=migrations/");

    let mut names: Vec<String> = Vec::new();
    if migrations_dir.exists() {
        names = fs::read_dir(migrations_dir)
            .expect("无法读取 migrations 目录")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            // 000_ 开头的文件保留给手工初始化脚本
            .filter(|name| name.ends_with(".sql") && !name.starts_with("000_"))
            .collect();
        names.sort();
    }

    let entries: Vec<String> = names
        .iter()
        .map(|file_name| {
            let version = file_name.trim_end_matches(".sql");
            format!(
                "    (\"{version}\", include_str!(concat!(env!(\"CARGO_MANIFEST_DIR\"), \"/migrations/{file_name}\")))",
            )
        })
        .collect();

    let mut f = fs::File::create(&dest_path).expect("无法创建 migrations.rs");
    writeln!(
        f,
        "/// (版本, SQL)，按版本号升序\n\
         pub const MIGRATIONS: &[(&str, &str)] = &[\n{}\n];",
        entries.join(",\n")
    )
    .expect("无法写入 migrations.rs");
}
