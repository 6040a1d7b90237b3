//! Manual smoke-test front end for `qmi-core` (spec.md 6.7). Not part of
//! the library's specified surface; it exists so the workspace has
//! something runnable alongside the library crate.

use std::time::Duration;

use clap::{App, Arg, SubCommand};
use qmi_core::{Device, DeviceConfig, NetPortConfig, Path};

fn main() {
    let matches = App::new("qmi-core-cli")
        .version("0.1")
        .about("Manual smoke-test driver for qmi-core")
        .arg(
            Arg::with_name("DEVICE")
                .long("device")
                .takes_value(true)
                .required(true)
                .help("Character device path, e.g. /dev/cdc-wdm0"),
        )
        .arg(
            Arg::with_name("mbim")
                .long("mbim")
                .help("Treat DEVICE as an MBIM node instead of QMUX"),
        )
        .arg(
            Arg::with_name("proxy")
                .long("proxy")
                .help("Open the QMUX device through the multiplexing proxy"),
        )
        .arg(
            Arg::with_name("timeout-secs")
                .long("timeout-secs")
                .takes_value(true)
                .default_value("10"),
        )
        .subcommand(SubCommand::with_name("get-device-info").about("Open the device and print supported services"))
        .subcommand(
            SubCommand::with_name("alloc-client")
                .about("Allocate a client id for a service and print it")
                .arg(Arg::with_name("SERVICE").required(true).help("Service id in hex, e.g. 0x02")),
        )
        .subcommand(
            SubCommand::with_name("send-raw")
                .about("Allocate a client, send a message id with no TLVs, print the raw response")
                .arg(Arg::with_name("SERVICE").required(true))
                .arg(Arg::with_name("MESSAGE_ID").required(true)),
        )
        .subcommand(
            SubCommand::with_name("add-link")
                .about("Create a data link for a mux id")
                .arg(Arg::with_name("DRIVER").required(true).help("rmnet or qmi_wwan"))
                .arg(Arg::with_name("MUX_ID").required(true)),
        )
        .subcommand(
            SubCommand::with_name("del-link")
                .about("Tear down a data link")
                .arg(Arg::with_name("DRIVER").required(true))
                .arg(Arg::with_name("MUX_ID").required(true)),
        )
        .subcommand(
            SubCommand::with_name("list-links")
                .about("List this driver's live data links")
                .arg(Arg::with_name("DRIVER").required(true)),
        )
        .get_matches();

    let logger = qmi_core::logging::default_logger();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    if let Err(e) = runtime.block_on(run(logger, &matches)) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(logger: slog::Logger, matches: &clap::ArgMatches<'_>) -> Result<(), qmi_core::CoreError> {
    let device_node = matches.value_of("DEVICE").unwrap().to_string();
    let timeout = Duration::from_secs(matches.value_of("timeout-secs").unwrap().parse().unwrap_or(10));
    let path = if matches.is_present("mbim") { Path::Mbim(device_node) } else { Path::Qmux(device_node) };

    let mut device = Device::new(logger, path, DeviceConfig::default());
    device.open(matches.is_present("proxy"), timeout).await?;

    let result = match matches.subcommand() {
        ("get-device-info", Some(_)) => get_device_info(&device, timeout).await,
        ("alloc-client", Some(sub)) => alloc_client(&device, sub, timeout).await,
        ("send-raw", Some(sub)) => send_raw(&device, sub, timeout).await,
        ("add-link", Some(sub)) => add_link(&device, sub, timeout).await,
        ("del-link", Some(sub)) => del_link(&device, sub, timeout).await,
        ("list-links", Some(sub)) => list_links(&device, sub, timeout).await,
        _ => {
            eprintln!("no subcommand given; see --help");
            Ok(())
        }
    };

    device.close(timeout).await?;
    result
}

async fn get_device_info(device: &Device, timeout: Duration) -> Result<(), qmi_core::CoreError> {
    device.query_supported_services(timeout).await?;
    match device.supported_services() {
        Some(versions) => {
            for v in versions {
                println!("service 0x{:02x}: v{}.{}", v.service, v.major, v.minor);
            }
        }
        None => println!("no services reported"),
    }
    Ok(())
}

fn parse_u8(s: &str) -> Result<u8, qmi_core::CoreError> {
    let s = s.trim_start_matches("0x");
    u8::from_str_radix(s, 16)
        .or_else(|_| s.parse())
        .map_err(|_| qmi_core::CoreError::invalid_args(format!("not a valid byte: {s}")))
}

fn parse_u16(s: &str) -> Result<u16, qmi_core::CoreError> {
    let s = s.trim_start_matches("0x");
    u16::from_str_radix(s, 16)
        .or_else(|_| s.parse())
        .map_err(|_| qmi_core::CoreError::invalid_args(format!("not a valid message id: {s}")))
}

async fn alloc_client(device: &Device, sub: &clap::ArgMatches<'_>, timeout: Duration) -> Result<(), qmi_core::CoreError> {
    let service = parse_u8(sub.value_of("SERVICE").unwrap())?;
    let client = device.allocate_client(service, timeout).await?;
    println!("allocated client id {} on service 0x{:02x}", client.client_id(), client.service());
    device.release_client(client, timeout).await
}

async fn send_raw(device: &Device, sub: &clap::ArgMatches<'_>, timeout: Duration) -> Result<(), qmi_core::CoreError> {
    let service = parse_u8(sub.value_of("SERVICE").unwrap())?;
    let message_id = parse_u16(sub.value_of("MESSAGE_ID").unwrap())?;
    let client = device.allocate_client(service, timeout).await?;
    let response = client.send(message_id, |_builder| Ok(()), timeout).await;
    device.release_client(client, timeout).await?;
    let response = response?;
    println!("response: {:02x?}", response.get_raw());
    Ok(())
}

async fn add_link(device: &Device, sub: &clap::ArgMatches<'_>, timeout: Duration) -> Result<(), qmi_core::CoreError> {
    let driver = sub.value_of("DRIVER").unwrap();
    let mux_id = parse_u8(sub.value_of("MUX_ID").unwrap())?;
    let manager = device.net_port_manager(driver, NetPortConfig::default())?;
    let link = tokio::time::timeout(timeout, manager.add_link(mux_id))
        .await
        .map_err(|_| qmi_core::CoreError::Timeout)??;
    println!("created link {} (mux id {})", link.ifname, link.mux_id);
    Ok(())
}

async fn del_link(device: &Device, sub: &clap::ArgMatches<'_>, timeout: Duration) -> Result<(), qmi_core::CoreError> {
    let driver = sub.value_of("DRIVER").unwrap();
    let mux_id = parse_u8(sub.value_of("MUX_ID").unwrap())?;
    let manager = device.net_port_manager(driver, NetPortConfig::default())?;
    tokio::time::timeout(timeout, manager.del_link(mux_id))
        .await
        .map_err(|_| qmi_core::CoreError::Timeout)?
}

async fn list_links(device: &Device, sub: &clap::ArgMatches<'_>, timeout: Duration) -> Result<(), qmi_core::CoreError> {
    let driver = sub.value_of("DRIVER").unwrap();
    let manager = device.net_port_manager(driver, NetPortConfig::default())?;
    let links = tokio::time::timeout(timeout, manager.links())
        .await
        .map_err(|_| qmi_core::CoreError::Timeout)??;
    for link in links {
        println!("{} (mux id {})", link.ifname, link.mux_id);
    }
    Ok(())
}
