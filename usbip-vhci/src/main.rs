use std::{
    sync::{Arc, mpsc},
    thread::{self, JoinHandle},
    time::Duration,
};

use clap::Parser;
use colored::Colorize;
use tracing_subscriber::{EnvFilter, filter::LevelFilter};
use usbip::{
    UsbDeviceInfo, UsbSpeed,
    client::{self, DeviceLocation},
    descriptor::{self, DescriptorError, DeviceDescriptor, EndpointMap, PipeType},
    net::UsbIpSocket,
    proto::setup::Recipient,
    session::{DeviceSession, ReceiveError, SessionConfig, SubmitError},
    status::UsbdStatus,
    urb::{DescriptorRequest, TransferBuffer, TransferError, TransferRequest},
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(clap::Parser)]
#[clap(name = "usbip-vhci")]
struct Args {
    #[clap(subcommand)]
    command: Command,
    #[arg(short = 'd', long)]
    debug: bool,
    #[arg(short = 'j', long)]
    json_output: bool,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Import a remote USB device and read its device and configuration
    /// descriptors
    Probe {
        /// Device location, usbip://host[:port]/busid
        #[arg(conflicts_with_all = ["remote", "bus_id"])]
        location: Option<DeviceLocation>,
        /// The machine with exported USB devices
        #[arg(short = 'r', long, requires = "bus_id")]
        remote: Option<String>,
        /// Bus ID of the device on the remote host
        #[arg(short = 'b', long, requires = "remote")]
        bus_id: Option<String>,
        /// TCP port of the remote usbipd
        #[arg(short = 't', long, default_value_t = UsbIpSocket::DEFAULT_PORT)]
        tcp_port: u16,
        /// Do not clear the halt of endpoints that returned a STALL
        #[arg(long)]
        no_reset_on_stall: bool,
    },
}

#[derive(Debug, thiserror::Error)]
enum ProbeError {
    #[error("failed to submit request ({0})")]
    Submit(#[from] SubmitError),
    #[error("request failed ({0})")]
    Transfer(#[from] TransferError),
    #[error("request completed with status {0}")]
    Status(UsbdStatus),
    #[error("no reply within {REQUEST_TIMEOUT:?}")]
    Timeout,
    #[error("invalid descriptor ({0})")]
    Descriptor(#[from] DescriptorError),
}

fn main() {
    let args = Args::parse();

    let level = if args.debug {
        LevelFilter::TRACE
    } else {
        LevelFilter::WARN
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Probe {
            location,
            remote,
            bus_id,
            tcp_port,
            no_reset_on_stall,
        } => {
            let location = match (location, remote, bus_id) {
                (Some(location), _, _) => location,
                (None, Some(remote), Some(bus_id)) => {
                    DeviceLocation::new(&remote, tcp_port, &bus_id)
                }
                _ => {
                    eprintln!(
                        "{} a device location or both --remote and --bus-id are required",
                        "Error:".red()
                    );
                    std::process::exit(2);
                }
            };

            let config = SessionConfig {
                reset_pipe_on_stall: !no_reset_on_stall,
                ..Default::default()
            };

            let (info, session) = match client::attach(&location, config) {
                Ok(attached) => attached,
                Err(e) => {
                    eprintln!("{} {e}", "Error:".red());
                    std::process::exit(1);
                }
            };

            let session = Arc::new(session);
            let reader = spawn_reader(Arc::clone(&session));

            let result = probe(&session);
            let snapshot = session.snapshot();

            if let Err(e) = session.unplug() {
                eprintln!("{} {e}", "Warning:".yellow());
            }
            if let Err(e) = session.transport().shutdown() {
                eprintln!("{} failed to close connection ({e})", "Warning:".yellow());
            }
            if reader.join().is_err() {
                eprintln!("{} receiver thread panicked", "Warning:".yellow());
            }

            match result {
                Ok((device, endpoints)) => {
                    if args.json_output {
                        let v = serde_json::json!({
                            "location": location,
                            "device": info,
                            "descriptor": device,
                            "endpoints": endpoints.iter().collect::<Vec<_>>(),
                            "session": snapshot,
                        });

                        println!("{}", serde_json::to_string(&v).unwrap())
                    } else {
                        print_probe(&location, &info, &device, &endpoints);
                    }
                }
                Err(e) => {
                    eprintln!("{} {e}", "Error:".red());
                    std::process::exit(1);
                }
            }
        }
    }
}

/// Dispatches replies until the connection closes
fn spawn_reader(session: Arc<DeviceSession<UsbIpSocket>>) -> JoinHandle<()> {
    thread::spawn(move || {
        loop {
            match session.receive() {
                Ok(_) => {}
                Err(ReceiveError::Protocol(e)) => {
                    eprintln!("{} dropping connection ({e})", "Warning:".yellow());
                    let _ = session.link_lost();
                    break;
                }
                Err(ReceiveError::Transport(_)) => {
                    // also the normal way out after unplug closed the socket
                    let _ = session.link_lost();
                    break;
                }
            }
        }
    })
}

fn get_descriptor(
    session: &DeviceSession<UsbIpSocket>,
    descriptor_type: u8,
    length: u16,
) -> Result<Vec<u8>, ProbeError> {
    let (tx, rx) = mpsc::channel();

    let seqnum = session.submit(
        TransferRequest::GetDescriptor(DescriptorRequest {
            recipient: Recipient::Device,
            descriptor_type,
            index: 0,
            language_id: 0,
            buffer: TransferBuffer::for_read(length.into()),
            status: UsbdStatus::Pending,
        }),
        tx.into(),
    )?;

    let Ok(completed) = rx.recv_timeout(REQUEST_TIMEOUT) else {
        session.unlink(seqnum);
        return Err(ProbeError::Timeout);
    };

    completed.result?;

    match completed.request.into_transfer() {
        Some(TransferRequest::GetDescriptor(r)) if r.status == UsbdStatus::Success => {
            Ok(r.buffer.active().unwrap_or_default().to_vec())
        }
        Some(r) => Err(ProbeError::Status(r.status())),
        None => Err(ProbeError::Status(UsbdStatus::InvalidParameter)),
    }
}

fn probe(
    session: &DeviceSession<UsbIpSocket>,
) -> Result<(DeviceDescriptor, EndpointMap), ProbeError> {
    let device = DeviceDescriptor::parse(&get_descriptor(
        session,
        descriptor::DEVICE,
        DeviceDescriptor::LENGTH,
    )?)?;

    let mut endpoints = EndpointMap::new();
    endpoints.set_default_max_packet_size(device.max_packet_size0.into());
    session.set_endpoints(endpoints);

    let header = get_descriptor(session, descriptor::CONFIGURATION, 9)?;
    let total_length = descriptor::configuration_total_length(&header)?;
    let configuration = get_descriptor(session, descriptor::CONFIGURATION, total_length)?;

    let mut endpoints = EndpointMap::from_configuration_descriptor(&configuration)?;
    endpoints.set_default_max_packet_size(device.max_packet_size0.into());
    session.set_endpoints(endpoints.clone());

    Ok((device, endpoints))
}

fn print_probe(
    location: &DeviceLocation,
    info: &UsbDeviceInfo,
    device: &DeviceDescriptor,
    endpoints: &EndpointMap,
) {
    println!("{}", location.to_string().bold());

    print!("{:>11}: ", "speed");

    match info.speed {
        UsbSpeed::Unknown => println!("Unknown Speed"),
        UsbSpeed::Low => println!("Low Speed(1.5Mbps)"),
        UsbSpeed::Full => println!("Full Speed(12Mbps)"),
        UsbSpeed::High => println!("High Speed(480Mbps)"),
        UsbSpeed::Wireless => println!("Wireless"),
        UsbSpeed::Super => println!("Super Speed(5000Mbps)"),
    }

    println!(
        "{:>11}: {:04x}:{:04x} rev {:04x}",
        "device", device.id_vendor, device.id_product, device.bcd_device
    );
    println!(
        "{:>11}: {:02x}/{:02x}/{:02x}, {} configuration(s)",
        "class",
        device.device_class,
        device.device_sub_class,
        device.device_protocol,
        device.num_configurations
    );
    println!(
        "{:>11}: {:03}/{:03} ({})",
        "remote", info.bus_num, info.dev_num, info.sys_path
    );

    println!();
    println!("Endpoints");
    println!("=========");

    for endpoint in endpoints.iter() {
        let pipe_type = match endpoint.pipe_type {
            PipeType::Control => "control",
            PipeType::Isochronous => "isochronous",
            PipeType::Bulk => "bulk",
            PipeType::Interrupt => "interrupt",
        };

        let direction = if endpoint.number() == 0 {
            "".normal()
        } else if endpoint.direction().is_in() {
            "IN".green()
        } else {
            "OUT".cyan()
        };

        println!(
            "  {:#04x} {pipe_type:<11} {:<3} max packet {:>4}, interval {}",
            endpoint.address,
            direction.to_string(),
            endpoint.max_packet_size,
            endpoint.interval
        );
    }
}
