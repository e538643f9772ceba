mod logger;

use std::fs::File;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};

use rusty_fat32::fs::entry::format_size;
use rusty_fat32::fs::fat::{CreateOutcome, PathNotice};
use rusty_fat32::fs::validate::validate_fat32;
use rusty_fat32::{format_image, FatFilesystem, FileEntry, FormatOptions};

const USAGE: &str = "\
usage: rusty-fat32 [-v] <image> <command> [args]

commands:
  info                  show boot sector and FSInfo details
  ls [-l] [path]        list a directory (default /)
  mkdir <path>          create a directory
  touch <path>          create an empty file
  cd <path>             resolve a directory path
  format [-L label] [-c sectors-per-cluster]
                        write a fresh FAT32 volume over the whole image
  check                 check the volume for inconsistencies";

fn main() -> ExitCode {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let verbose = take_flag(&mut args, "-v");
    logger::init(verbose);

    if args.iter().any(|a| a == "--version") {
        println!("rusty-fat32 {}", env!("APP_VERSION"));
        return ExitCode::SUCCESS;
    }

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(mut args: Vec<String>) -> Result<ExitCode> {
    if args.len() < 2 {
        bail!("{USAGE}");
    }
    let image = args.remove(0);
    let command = args.remove(0);

    match command.as_str() {
        "info" => info(&image)?,
        "ls" => {
            let long = take_flag(&mut args, "-l");
            let path = args.first().map(String::as_str).unwrap_or("/");
            list(&image, path, long)?;
        }
        "mkdir" => create(&image, required(&args, "mkdir")?, true)?,
        "touch" => create(&image, required(&args, "touch")?, false)?,
        "cd" => change_dir(&image, required(&args, "cd")?)?,
        "format" => format(&image, &mut args)?,
        "check" => return check(&image),
        other => bail!("Unknown command: {other}\n\n{USAGE}"),
    }
    Ok(ExitCode::SUCCESS)
}

fn take_flag(args: &mut Vec<String>, flag: &str) -> bool {
    let before = args.len();
    args.retain(|a| a != flag);
    args.len() != before
}

fn take_option(args: &mut Vec<String>, flag: &str) -> Result<Option<String>> {
    let Some(pos) = args.iter().position(|a| a == flag) else {
        return Ok(None);
    };
    if pos + 1 >= args.len() {
        bail!("{flag} needs a value");
    }
    let value = args.remove(pos + 1);
    args.remove(pos);
    Ok(Some(value))
}

fn required<'a>(args: &'a [String], command: &str) -> Result<&'a str> {
    match args.first() {
        Some(path) => Ok(path.as_str()),
        None => bail!("{command}: path required"),
    }
}

fn info(image: &str) -> Result<()> {
    let mut fs = FatFilesystem::open_image_read_only(image)
        .with_context(|| format!("failed to open {image}"))?;
    let bs = fs.boot_sector().clone();
    let geo = *fs.geometry();

    println!("Volume label:        {}", bs.label().unwrap_or_else(|| "NO NAME".into()));
    println!("Volume serial:       {}", fs.volume_serial());
    println!("OEM name:            {}", String::from_utf8_lossy(&bs.oem_name).trim_end());
    println!("Bytes per sector:    {}", geo.bytes_per_sector);
    println!("Sectors per cluster: {}", geo.sectors_per_cluster);
    println!("Reserved sectors:    {}", geo.reserved_sectors);
    println!("FAT copies:          {}", geo.num_fats);
    println!("Sectors per FAT:     {}", geo.fat_size);
    println!("Total sectors:       {}", geo.total_sectors);
    println!("First data sector:   {}", geo.first_data_sector);
    println!("Total clusters:      {}", geo.total_clusters);
    println!("Root cluster:        {}", geo.root_cluster);
    println!("Media descriptor:    0x{:02X}", bs.media);

    let hints = *fs.fs_info();
    match hints.free_count_hint(geo.total_clusters) {
        Some(free) => println!("FSInfo free count:   {free}"),
        None => println!("FSInfo free count:   unknown"),
    }
    match hints.next_free_hint(&geo) {
        Some(next) => println!("FSInfo next free:    {next}"),
        None => println!("FSInfo next free:    unknown"),
    }
    let free = fs.free_bytes()?;
    println!(
        "Free space:          {} ({})",
        format_size(free),
        with_spaces(free)
    );
    Ok(())
}

fn list(image: &str, path: &str, long: bool) -> Result<()> {
    let mut fs = FatFilesystem::open_image_read_only(image)
        .with_context(|| format!("failed to open {image}"))?;
    let root = fs.working_root();
    let target = fs.resolve_path(path, &root)?;
    report_notices(&target.notices);
    let entries = fs.list_dir(target.cluster)?;

    if !long {
        for entry in entries.iter().filter(|e| !e.is_dot_entry()) {
            if entry.is_directory() {
                println!("{}/", entry.name);
            } else {
                println!("{}", entry.name);
            }
        }
        return Ok(());
    }

    let serial = fs.volume_serial();
    match fs.boot_sector().label() {
        Some(label) => println!(" Volume in drive is {label}"),
        None => println!(" Volume in drive has no label"),
    }
    println!(" Volume Serial Number is {serial}");
    println!("Directory for ::{}", target.path);
    println!();

    let mut files = 0u64;
    let mut bytes = 0u64;
    for entry in &entries {
        println!("{}", long_line(entry));
        if entry.is_file() {
            files += 1;
            bytes += entry.size;
        }
    }
    let free = fs.free_bytes()?;
    println!("{files:>9} file(s) {:>15} bytes", with_spaces(bytes));
    println!("{:>33} bytes free", with_spaces(free));
    Ok(())
}

/// One DOS-style row: 8.3 name in columns, size or `<DIR>`, attribute
/// flags, write date and time, then the long name when there is one.
fn long_line(entry: &FileEntry) -> String {
    let (base, ext) = if entry.is_dot_entry() {
        (entry.short_name.as_str(), "")
    } else {
        entry
            .short_name
            .rsplit_once('.')
            .unwrap_or((entry.short_name.as_str(), ""))
    };
    let size = if entry.is_directory() {
        "<DIR>    ".to_string()
    } else {
        format!("{:>9}", with_spaces(entry.size))
    };
    let flags = entry.attributes.flag_string();
    let modified = entry.modified_string();
    let mut line = format!("{base:<8} {ext:<3} {size} {flags} {modified:<19}");
    if let Some(long) = &entry.long_name {
        line.push(' ');
        line.push_str(long);
    }
    line
}

fn create(image: &str, path: &str, is_dir: bool) -> Result<()> {
    let mut fs =
        FatFilesystem::open_image(image).with_context(|| format!("failed to open {image}"))?;
    let root = fs.working_root();
    match fs.create_at_path(path, &root, is_dir)? {
        CreateOutcome::Created(entry) => {
            let kind = if is_dir { "directory" } else { "file" };
            println!("Created {kind} {} ({})", entry.path, entry.short_name);
        }
        CreateOutcome::Existing(entry) => {
            if is_dir {
                bail!("Directory {} already exists", entry.path);
            }
            println!("Updated access date of {}", entry.path);
        }
    }
    Ok(())
}

fn change_dir(image: &str, path: &str) -> Result<()> {
    let mut fs = FatFilesystem::open_image_read_only(image)
        .with_context(|| format!("failed to open {image}"))?;
    let mut cwd = fs.working_root();
    let notices = cwd.change(&mut fs, path)?;
    report_notices(&notices);
    println!("{} (cluster {})", cwd.path(), cwd.cluster());
    Ok(())
}

fn format(image: &str, args: &mut Vec<String>) -> Result<()> {
    let mut opts = FormatOptions::default();
    if let Some(label) = take_option(args, "-L")? {
        opts.volume_label = Some(label);
    }
    if let Some(spc) = take_option(args, "-c")? {
        opts.sectors_per_cluster = spc
            .parse()
            .with_context(|| format!("invalid sectors per cluster: {spc}"))?;
    }
    let bs = format_image(image, &opts).with_context(|| format!("failed to format {image}"))?;
    println!(
        "Formatted {image}: {} sectors, {} sectors per FAT, serial {}",
        bs.total_sectors(),
        bs.fat_size(),
        bs.serial_string()
    );
    Ok(())
}

fn check(image: &str) -> Result<ExitCode> {
    let mut file = File::open(image).with_context(|| format!("failed to open {image}"))?;
    let warnings = validate_fat32(&mut file, &mut |msg| println!("{msg}"))?;
    Ok(if warnings.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn report_notices(notices: &[PathNotice]) {
    for notice in notices {
        match notice {
            PathNotice::AboveRoot => println!("No entry above root directory"),
        }
    }
}

/// Group digits in threes with spaces: `1 234 567`.
fn with_spaces(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(' ');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rusty_fat32::fs::dir_entry::{Attributes, CaseFlags, FatTimestamp, ShortEntry};
    use rusty_fat32::fs::entry::EntrySlot;

    #[test]
    fn test_with_spaces() {
        assert_eq!(with_spaces(0), "0");
        assert_eq!(with_spaces(999), "999");
        assert_eq!(with_spaces(1000), "1 000");
        assert_eq!(with_spaces(20_632_576), "20 632 576");
    }

    #[test]
    fn test_long_line_columns() {
        let written = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 30, 10)
            .unwrap();
        let short = ShortEntry::new(
            *b"AVERYL~1TXT",
            CaseFlags::empty(),
            Attributes::ARCHIVE | Attributes::READ_ONLY,
            5,
            FatTimestamp::from_datetime(&written),
        );
        let mut entry = FileEntry::from_short(
            &short,
            Some("a_very_long_filename.txt".into()),
            "/",
            2,
            EntrySlot {
                sector: 700,
                offset: 64,
            },
        );
        entry.size = 12_345;
        assert_eq!(
            long_line(&entry),
            "AVERYL~1 TXT    12 345 -r--a 2024-05-01 12:30:10 a_very_long_filename.txt"
        );

        let dir = ShortEntry::new(
            *b"DOCS       ",
            CaseFlags::empty(),
            Attributes::DIRECTORY,
            9,
            FatTimestamp::default(),
        );
        let slot = EntrySlot {
            sector: 700,
            offset: 0,
        };
        let entry = FileEntry::from_short(&dir, None, "/", 2, slot);
        assert_eq!(
            long_line(&entry),
            format!("DOCS         <DIR>     d---- {:19}", "")
        );
    }

    #[test]
    fn test_flag_parsing() {
        let mut args: Vec<String> = ["-l", "/DOCS", "-L", "BACKUP"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(take_flag(&mut args, "-l"));
        assert!(!take_flag(&mut args, "-l"));
        assert_eq!(take_option(&mut args, "-L").unwrap().as_deref(), Some("BACKUP"));
        assert_eq!(args, vec!["/DOCS".to_string()]);

        let mut dangling = vec!["-c".to_string()];
        assert!(take_option(&mut dangling, "-c").is_err());
    }
}
