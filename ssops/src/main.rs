use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use zeroize::Zeroizing;

use ssops_core::envelope::{self, UnwrapContext};
use ssops_core::keystore::KeyStore;
use ssops_core::method;
use ssops_core::protect::{self, AgentSigner, TtyPrompt};
use ssops_core::types::{RECIPIENT_KIND_RSA, RecipientDescriptor};
use ssops_core::{Error, Result};

fn main() {
    // Reset SIGPIPE to default so piping output to `head` etc. exits cleanly
    // instead of panicking with "broken pipe".
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let debug = take_flag(&mut args, &["-d", "--debug"]);

    tracing_subscriber::fmt()
        .with_env_filter(if debug { "debug" } else { "warn" })
        .with_writer(io::stderr)
        .init();

    if let Err(err) = run(args) {
        report_error(&err, debug);
        std::process::exit(1);
    }
}

fn run(mut args: Vec<String>) -> anyhow::Result<()> {
    let cmd = if args.is_empty() {
        "help".to_string()
    } else {
        args.remove(0)
    };

    match cmd.as_str() {
        "encrypt" => cmd_encrypt(args)?,
        "decrypt" => cmd_decrypt(args)?,
        "key" => cmd_key(args)?,
        "method" => cmd_method(args)?,
        "help" | "--help" | "-h" => print_help(),
        other => {
            eprintln!("unknown command: {other}");
            print_help();
            std::process::exit(1);
        }
    }
    Ok(())
}

fn print_help() {
    println!(
        "\
ssops - share secrets with a recipient set

USAGE:
    ssops [-d|--debug] <command> [args...]

COMMANDS:
    encrypt <method-file> [-f NAME] [-i IN|-] [-o OUT|-]
                                        Encrypt input for every recipient of the method
    decrypt [-f NAME] [-i IN|-] [-o OUT|-]
                                        Decrypt an artifact with any one private key

    key gen <name> [-t rsa] [--ssh <pub>]
                                        Generate a key pair; protect it with a passphrase,
                                        or with the SSH agent when --ssh is given
    key check <name>                    Verify the stored key can be unwrapped
    key protect <name> [--ssh <pub>]    Re-wrap an existing key under a new protection
    key list                            List keys in the local store

    method <file> create                Start an empty recipient list
    method <file> show                  Show recipients as a table
    method <file> add-key <name> [-e|--embed]
                                        Add a local key's recipient entry; --embed copies
                                        the encrypted private key into the method
    method <file> add-ssh-key <pub>     Add a recipient from an SSH public key file

    help                                Show this help

FLAGS:
    -d, --debug                         Full error cause chains and debug logging on stderr
    -i/-o default to '-' (stdin/stdout)

NOTES:
    Keys live under ~/.ssops (one '<name>' record plus '<name>.pub' each).
    Decryption tries artifact entries in order; leave a passphrase prompt
    empty to skip that key and move on to the next one.

EXAMPLES:
    ssops key gen alex
    ssops method dev create
    ssops method dev add-key alex
    echo secret | ssops encrypt dev -o secrets.enc
    ssops decrypt -i secrets.enc
    ssops key protect alex --ssh ~/.ssh/id_rsa.pub"
    );
}

fn report_error(err: &anyhow::Error, debug: bool) {
    eprintln!("error: {err}");
    if !debug {
        return;
    }
    for cause in err.chain().skip(1) {
        eprintln!("  caused by: {cause}");
    }
    if let Some(Error::AllRecipientsFailed(causes)) = err.downcast_ref::<Error>() {
        for (name, cause) in causes {
            eprintln!("  recipient {name}:");
            let mut current: Option<&dyn std::error::Error> = Some(cause);
            while let Some(e) = current {
                eprintln!("    {e}");
                current = std::error::Error::source(e);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn take_flag(args: &mut Vec<String>, names: &[&str]) -> bool {
    let before = args.len();
    args.retain(|a| !names.contains(&a.as_str()));
    args.len() != before
}

/// Remove `-x VALUE` (or `--long=VALUE`) from `args` and return the value.
fn take_opt(args: &mut Vec<String>, names: &[&str]) -> Option<String> {
    let mut i = 0;
    while i < args.len() {
        if names.contains(&args[i].as_str()) {
            if i + 1 >= args.len() {
                usage_exit(&format!("{} requires a value", args[i]));
            }
            let value = args.remove(i + 1);
            args.remove(i);
            return Some(value);
        }
        for name in names.iter().filter(|n| n.starts_with("--")) {
            let prefix = format!("{name}=");
            if let Some(value) = args[i].strip_prefix(&prefix) {
                let value = value.to_string();
                args.remove(i);
                return Some(value);
            }
        }
        i += 1;
    }
    None
}

fn take_positional(args: &mut Vec<String>, what: &str) -> String {
    if args.is_empty() {
        usage_exit(&format!("missing {what}"));
    }
    args.remove(0)
}

fn reject_extra(args: &[String]) {
    if let Some(extra) = args.first() {
        usage_exit(&format!("unexpected argument: {extra}"));
    }
}

fn usage_exit(msg: &str) -> ! {
    eprintln!("error: {msg}");
    eprintln!("run 'ssops help' for usage");
    std::process::exit(1);
}

// ---------------------------------------------------------------------------
// Stream I/O (`-` means stdio)
// ---------------------------------------------------------------------------

fn read_input(input: Option<&str>) -> Result<Zeroizing<Vec<u8>>> {
    let mut buf = Zeroizing::new(Vec::new());
    match input {
        None | Some("-") => {
            io::stdin().read_to_end(&mut buf)?;
        }
        Some(path) => {
            *buf = fs::read(path)?;
        }
    }
    Ok(buf)
}

fn write_output(output: Option<&str>, data: &[u8]) -> Result<()> {
    match output {
        None | Some("-") => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(data)?;
            stdout.flush()?;
        }
        Some(path) => {
            let mut file = fs::File::create(path)?;
            file.write_all(data)?;
            file.flush()?;
            file.sync_all()?;
            if let Some(dir) = Path::new(path).parent() {
                // A bare relative filename has parent "", which means the cwd.
                let dir = if dir.as_os_str().is_empty() {
                    Path::new(".")
                } else {
                    dir
                };
                fs::File::open(dir)?.sync_all()?;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// encrypt / decrypt
// ---------------------------------------------------------------------------

fn cmd_encrypt(mut args: Vec<String>) -> Result<()> {
    let method_path = take_positional(&mut args, "method file");
    let filter = take_opt(&mut args, &["-f", "--filter"]);
    let input = take_opt(&mut args, &["-i", "--input"]);
    let output = take_opt(&mut args, &["-o", "--output"]);
    reject_extra(&args);

    let method = method::load(Path::new(&method_path))?;
    let plaintext = read_input(input.as_deref())?;
    let entries = envelope::encrypt_to_artifact(&method, filter.as_deref(), &plaintext)?;
    let text = envelope::render_artifact(&entries)?;
    write_output(output.as_deref(), text.as_bytes())
}

fn cmd_decrypt(mut args: Vec<String>) -> Result<()> {
    let filter = take_opt(&mut args, &["-f", "--filter"]);
    let input = take_opt(&mut args, &["-i", "--input"]);
    let output = take_opt(&mut args, &["-o", "--output"]);
    reject_extra(&args);

    let text = read_input(input.as_deref())?;
    let entries = envelope::parse_artifact(
        std::str::from_utf8(&text)
            .map_err(|e| Error::ConfigInvalid(format!("artifact is not UTF-8: {e}")))?,
    )?;

    let store = KeyStore::open_default()?;
    let mut prompt = TtyPrompt;
    let mut signer = AgentSigner::new();
    let mut ctx = UnwrapContext {
        prompt: &mut prompt,
        signer: &mut signer,
    };
    let plaintext = envelope::decrypt_from_artifact(&entries, filter.as_deref(), &store, &mut ctx)?;
    write_output(output.as_deref(), &plaintext)
}

// ---------------------------------------------------------------------------
// key subcommands
// ---------------------------------------------------------------------------

fn cmd_key(mut args: Vec<String>) -> Result<()> {
    let sub = take_positional(&mut args, "key subcommand");
    match sub.as_str() {
        "gen" => cmd_key_gen(args),
        "check" => cmd_key_check(args),
        "protect" => cmd_key_protect(args),
        "list" => cmd_key_list(args),
        other => usage_exit(&format!("unknown key subcommand: {other}")),
    }
}

fn cmd_key_gen(mut args: Vec<String>) -> Result<()> {
    let name = take_positional(&mut args, "key name");
    let key_type = take_opt(&mut args, &["-t", "--type"]).unwrap_or_else(|| "rsa".to_string());
    let ssh_pub = take_opt(&mut args, &["--ssh"]);
    reject_extra(&args);

    if key_type != RECIPIENT_KIND_RSA {
        return Err(Error::UnsupportedRecipientKind(key_type));
    }

    let store = KeyStore::open_default()?;
    let generated = ssops_core::keys::generate_rsa()?;
    let record = wrap_new_key(&name, generated.private_pem.as_bytes(), ssh_pub.as_deref())?;
    store.write(&record, &generated.public_pem, false)?;
    println!("Created key '{name}' in {}", store.root().display());
    Ok(())
}

fn cmd_key_check(mut args: Vec<String>) -> Result<()> {
    let name = take_positional(&mut args, "key name");
    reject_extra(&args);

    let store = KeyStore::open_default()?;
    let (record, _public) = store.load(&name)?;
    let mut prompt = TtyPrompt;
    let mut signer = AgentSigner::new();
    let _plaintext = protect::unwrap(&record, &mut prompt, &mut signer)?;
    println!("ok");
    Ok(())
}

fn cmd_key_protect(mut args: Vec<String>) -> Result<()> {
    let name = take_positional(&mut args, "key name");
    let ssh_pub = take_opt(&mut args, &["--ssh"]);
    reject_extra(&args);

    let store = KeyStore::open_default()?;
    let (record, public_pem) = store.load(&name)?;

    let mut prompt = TtyPrompt;
    let mut signer = AgentSigner::new();
    let plaintext = protect::unwrap(&record, &mut prompt, &mut signer)?;

    let rewrapped = wrap_new_key(&name, &plaintext, ssh_pub.as_deref())?;
    store.write(&rewrapped, &public_pem, true)?;
    println!(
        "Key '{name}' is now protected by {}",
        rewrapped.protection.kind()
    );
    Ok(())
}

fn cmd_key_list(args: Vec<String>) -> Result<()> {
    reject_extra(&args);
    let store = KeyStore::open_default()?;
    for name in store.list()? {
        println!("{name}");
    }
    Ok(())
}

/// Wrap fresh key material under the requested protection.
fn wrap_new_key(
    name: &str,
    plaintext: &[u8],
    ssh_pub: Option<&str>,
) -> Result<ssops_core::types::PrivateKeyRecord> {
    match ssh_pub {
        Some(pub_path) => {
            let line = protect::read_ssh_public_key_file(Path::new(pub_path))?;
            let mut signer = AgentSigner::new();
            protect::wrap_with_agent(name, plaintext, &line, &mut signer)
        }
        None => {
            let mut prompt = TtyPrompt;
            protect::wrap_with_passphrase(name, plaintext, &mut prompt)
        }
    }
}

// ---------------------------------------------------------------------------
// method subcommands
// ---------------------------------------------------------------------------

fn cmd_method(mut args: Vec<String>) -> Result<()> {
    let file = take_positional(&mut args, "method file");
    let sub = take_positional(&mut args, "method subcommand");
    let path = Path::new(&file);

    match sub.as_str() {
        "create" => {
            method::create(path)?;
            println!("Created method file {}", path.display());
            Ok(())
        }
        "show" => cmd_method_show(path, args),
        "add-key" => cmd_method_add_key(path, args),
        "add-ssh-key" => cmd_method_add_ssh_key(path, args),
        other => usage_exit(&format!("unknown method subcommand: {other}")),
    }
}

fn cmd_method_show(path: &Path, args: Vec<String>) -> Result<()> {
    reject_extra(&args);
    let method = method::load(path)?;
    if method.methods.is_empty() {
        println!("No recipients in {}.", path.display());
        return Ok(());
    }

    let name_w = method
        .methods
        .iter()
        .map(|d| d.name.len())
        .chain(["NAME".len()])
        .max()
        .unwrap_or(4);
    let kind_w = method
        .methods
        .iter()
        .map(|d| d.kind.len())
        .chain(["KIND".len()])
        .max()
        .unwrap_or(4);

    println!("{:<name_w$}  {:<kind_w$}  EMBEDDED", "NAME", "KIND");
    println!("{}", "-".repeat(name_w + kind_w + 12));
    for descriptor in &method.methods {
        println!(
            "{:<name_w$}  {:<kind_w$}  {}",
            descriptor.name,
            descriptor.kind,
            if descriptor.encrypted_private_key.is_some() {
                "yes"
            } else {
                "no"
            }
        );
    }
    Ok(())
}

fn cmd_method_add_key(path: &Path, mut args: Vec<String>) -> Result<()> {
    let name = take_positional(&mut args, "key name");
    let embed = take_flag(&mut args, &["-e", "--embed"]);
    reject_extra(&args);

    let store = KeyStore::open_default()?;
    let (record, public_pem) = store.load(&name)?;

    let descriptor = RecipientDescriptor {
        kind: RECIPIENT_KIND_RSA.to_string(),
        name: name.clone(),
        public_key: public_pem,
        encrypted_private_key: embed.then_some(record),
    };

    let mut method = method::load(path)?;
    method::add_recipient(&mut method, descriptor)?;
    method::save(path, &method)?;
    println!(
        "Added recipient '{name}'{} to {}",
        if embed { " (embedded key)" } else { "" },
        path.display()
    );
    Ok(())
}

fn cmd_method_add_ssh_key(path: &Path, mut args: Vec<String>) -> Result<()> {
    let pub_file = take_positional(&mut args, "SSH public key file");
    reject_extra(&args);

    let descriptor = method::import_ssh_public_key(Path::new(&pub_file))?;
    let name = descriptor.name.clone();

    let mut method = method::load(path)?;
    method::add_recipient(&mut method, descriptor)?;
    method::save(path, &method)?;
    println!("Added SSH recipient '{name}' to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn take_flag_removes_all_spellings() {
        let mut a = args(&["-d", "encrypt", "--debug"]);
        assert!(take_flag(&mut a, &["-d", "--debug"]));
        assert_eq!(a, args(&["encrypt"]));
        assert!(!take_flag(&mut a, &["-d", "--debug"]));
    }

    #[test]
    fn take_opt_handles_separate_and_joined_forms() {
        let mut a = args(&["dev", "-f", "alex", "-o", "out"]);
        assert_eq!(take_opt(&mut a, &["-f", "--filter"]).as_deref(), Some("alex"));
        assert_eq!(a, args(&["dev", "-o", "out"]));

        let mut a = args(&["--filter=alex", "dev"]);
        assert_eq!(take_opt(&mut a, &["-f", "--filter"]).as_deref(), Some("alex"));
        assert_eq!(a, args(&["dev"]));

        let mut a = args(&["dev"]);
        assert_eq!(take_opt(&mut a, &["-f", "--filter"]), None);
    }
}
