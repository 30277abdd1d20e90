use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "quota-proxy")]
#[command(author, version, about = "Forward HTTP/CONNECT proxy with per-client traffic quotas", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)，设置了 RUST_LOG 时以其为准
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// 把日志写入该文件而不是终端
    #[arg(long, value_name = "PATH", global = true)]
    pub log_file: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行代理
    Run {
        /// 配置文件路径
        #[arg(short, long, default_value = "proxy.toml")]
        config: String,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long, default_value = "proxy.toml")]
        config: String,

        /// 输出格式
        #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },
    /// 生成示例配置
    Template {
        /// 输出文件路径（默认输出到标准输出）
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from(["quota-proxy", "run", "-c", "/etc/proxy.toml"]).unwrap();
        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Run { config } => assert_eq!(config, "/etc/proxy.toml"),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "quota-proxy",
            "check",
            "--format",
            "json",
            "-l",
            "debug",
            "--log-file",
            "/tmp/proxy.log",
        ])
        .unwrap();
        assert_eq!(cli.log_level, "debug");
        assert_eq!(cli.log_file.as_deref(), Some("/tmp/proxy.log"));
        match cli.command {
            Commands::Check { config, format } => {
                assert_eq!(config, "proxy.toml");
                assert_eq!(format, "json");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_reject_unknown_format() {
        assert!(Cli::try_parse_from(["quota-proxy", "check", "--format", "yaml"]).is_err());
    }
}
