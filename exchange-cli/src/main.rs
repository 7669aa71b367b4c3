//! Exchange CLI
//!
//! Command-line interface for the exchange back office API.

use std::collections::BTreeSet;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;

use exchange_client::ExchangeClient;
use exchange_types::{
    AttachDocumentRequest, BranchId, CreateBranchRequest, CreateCurrencyRequest,
    CreateOrderRequest, CreateRateRequest, CreateReviewRequest, CurrencyCode, DocumentType,
    OrderId, OrderItemRequest, OrderStatus, QuoteRequest, RateFilter, RateId,
    RecordPurchaseRequest, ReviewId, Role, SetRolesRequest, UpdateOrderStatusRequest,
    UpdateProfileRequest, UpdateRateRequest, UserId,
};

#[derive(Parser)]
#[command(name = "exchange")]
#[command(author, version, about = "Exchange back office CLI client", long_about = None)]
struct Cli {
    /// Base URL of the exchange API
    #[arg(
        long,
        env = "EXCHANGE_API_URL",
        default_value = "http://localhost:3000"
    )]
    api_url: String,

    /// Bearer token (JWT) for authentication
    #[arg(long, env = "EXCHANGE_API_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Currency catalog
    Currency {
        #[command(subcommand)]
        action: CurrencyCommands,
    },
    /// Branches and their balances
    Branch {
        #[command(subcommand)]
        action: BranchCommands,
    },
    /// Exchange rates and quotes
    Rate {
        #[command(subcommand)]
        action: RateCommands,
    },
    /// Order operations
    Order {
        #[command(subcommand)]
        action: OrderCommands,
    },
    /// Look up an order by tracking code
    Track {
        tracking_code: String,
    },
    /// Review operations
    Review {
        #[command(subcommand)]
        action: ReviewCommands,
    },
    /// User profile, referrals and roles
    User {
        #[command(subcommand)]
        action: UserCommands,
    },
    /// Check API health
    Health,
}

#[derive(Subcommand)]
enum CurrencyCommands {
    /// List currencies
    List {
        /// Include retired currencies (staff only)
        #[arg(long)]
        all: bool,
    },
    /// Get a currency by code
    Get { code: CurrencyCode },
    /// Add a currency to the catalog
    Create {
        code: CurrencyCode,
        #[arg(long)]
        name: String,
        #[arg(long)]
        symbol: String,
        #[arg(long, default_value = "2")]
        decimal_places: u32,
    },
    /// Retire a currency
    Deactivate { code: CurrencyCode },
}

#[derive(Subcommand)]
enum BranchCommands {
    /// List branches
    List,
    /// Get branch details
    Get { id: BranchId },
    /// Open a branch
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        city: String,
        #[arg(long)]
        address: String,
        #[arg(long)]
        phone: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        base_currency: CurrencyCode,
        #[arg(long)]
        manager: Option<UserId>,
    },
    /// Show what a branch holds
    Balances { id: BranchId },
    /// Record that a branch bought currency
    Purchase {
        id: BranchId,
        #[arg(long)]
        currency: CurrencyCode,
        #[arg(long)]
        amount: Decimal,
        #[arg(long)]
        rate: Decimal,
    },
}

#[derive(Subcommand)]
enum RateCommands {
    /// List rates
    List {
        #[arg(long)]
        branch: Option<BranchId>,
        /// Include deactivated rates (staff only)
        #[arg(long)]
        all: bool,
    },
    /// Get a rate
    Get { id: RateId },
    /// Publish a rate
    Create {
        #[arg(long)]
        branch: BranchId,
        #[arg(long)]
        from: CurrencyCode,
        #[arg(long)]
        to: CurrencyCode,
        #[arg(long)]
        rate: Decimal,
        #[arg(long, default_value = "0")]
        min_amount: Decimal,
    },
    /// Change a rate's value, minimum or active flag
    Update {
        id: RateId,
        #[arg(long)]
        rate: Option<Decimal>,
        #[arg(long)]
        min_amount: Option<Decimal>,
        #[arg(long)]
        active: Option<bool>,
    },
    /// Price an exchange, from a source or a target amount
    Quote {
        id: RateId,
        #[arg(long, conflicts_with = "amount_to", required_unless_present = "amount_to")]
        amount_from: Option<Decimal>,
        #[arg(long)]
        amount_to: Option<Decimal>,
    },
}

#[derive(Subcommand)]
enum OrderCommands {
    /// List orders visible to the caller
    List,
    /// Get order details
    Get { id: OrderId },
    /// Place an order
    Create {
        #[arg(long)]
        branch: BranchId,
        #[arg(long)]
        email: String,
        #[arg(long)]
        phone: Option<String>,
        /// Request delivery to this address
        #[arg(long)]
        delivery_address: Option<String>,
        /// Order leg as FROM:TO:AMOUNT, e.g. USD:EUR:100 (repeatable)
        #[arg(long = "item", value_parser = parse_item, required = true)]
        items: Vec<OrderItemRequest>,
    },
    /// Move an order to a new status
    Status { id: OrderId, status: OrderStatus },
    /// Delete a new order
    Delete { id: OrderId },
    /// List an order's documents
    Documents { id: OrderId },
    /// Attach a document reference to an order
    Attach {
        id: OrderId,
        #[arg(long = "type")]
        doc_type: DocumentType,
        #[arg(long)]
        file: String,
    },
}

#[derive(Subcommand)]
enum ReviewCommands {
    /// List reviews visible to the caller
    List,
    /// List published reviews
    Public,
    /// Review one of your orders
    Create {
        #[arg(long)]
        order: OrderId,
        #[arg(long)]
        rating: u8,
        #[arg(long)]
        text: String,
    },
    /// Publish a review
    Show { id: ReviewId },
    /// Hide a review
    Hide { id: ReviewId },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Show your profile
    Me,
    /// Edit your profile
    Update {
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        telegram: Option<String>,
    },
    /// Apply someone's referral code
    Referral { code: String },
    /// List users who joined with your code
    Referrals,
    /// Replace a user's roles (comma-separated)
    Roles {
        id: UserId,
        #[arg(long, value_delimiter = ',')]
        roles: Vec<Role>,
    },
}

fn parse_item(s: &str) -> Result<OrderItemRequest, String> {
    let parts: Vec<&str> = s.split(':').collect();
    let [from, to, amount] = parts.as_slice() else {
        return Err(format!("Expected FROM:TO:AMOUNT, got {}", s));
    };
    Ok(OrderItemRequest {
        from_currency: CurrencyCode::parse(from).map_err(|e| e.to_string())?,
        to_currency: CurrencyCode::parse(to).map_err(|e| e.to_string())?,
        from_amount: amount
            .parse()
            .map_err(|_| format!("Invalid amount: {}", amount))?,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let mut client = ExchangeClient::new(&cli.api_url);
    if let Some(token) = cli.token {
        client = client.with_token(token);
    }

    match cli.command {
        Commands::Health => {
            let healthy = client.health().await?;
            if healthy {
                println!("✓ API is healthy");
            } else {
                println!("✗ API is not healthy");
                std::process::exit(1);
            }
        }

        Commands::Currency { action } => match action {
            CurrencyCommands::List { all } => print_json(&client.list_currencies(all).await?)?,
            CurrencyCommands::Get { code } => print_json(&client.get_currency(code).await?)?,
            CurrencyCommands::Create {
                code,
                name,
                symbol,
                decimal_places,
            } => {
                let req = CreateCurrencyRequest {
                    code,
                    name,
                    symbol,
                    decimal_places,
                };
                print_json(&client.create_currency(&req).await?)?;
            }
            CurrencyCommands::Deactivate { code } => {
                let req = exchange_types::UpdateCurrencyRequest {
                    is_active: Some(false),
                    ..Default::default()
                };
                print_json(&client.update_currency(code, &req).await?)?;
            }
        },

        Commands::Branch { action } => match action {
            BranchCommands::List => print_json(&client.list_branches().await?)?,
            BranchCommands::Get { id } => print_json(&client.get_branch(id).await?)?,
            BranchCommands::Create {
                name,
                city,
                address,
                phone,
                email,
                base_currency,
                manager,
            } => {
                let req = CreateBranchRequest {
                    name,
                    city,
                    address,
                    phone,
                    email,
                    base_currency,
                    manager_id: manager,
                    working_hours: Default::default(),
                };
                print_json(&client.create_branch(&req).await?)?;
            }
            BranchCommands::Balances { id } => print_json(&client.list_balances(id).await?)?,
            BranchCommands::Purchase {
                id,
                currency,
                amount,
                rate,
            } => {
                let req = RecordPurchaseRequest {
                    currency,
                    amount,
                    rate,
                };
                print_json(&client.record_purchase(id, &req).await?)?;
            }
        },

        Commands::Rate { action } => match action {
            RateCommands::List { branch, all } => {
                let filter = RateFilter {
                    branch_id: branch,
                    include_inactive: all,
                };
                print_json(&client.list_rates(&filter).await?)?;
            }
            RateCommands::Get { id } => print_json(&client.get_rate(id).await?)?,
            RateCommands::Create {
                branch,
                from,
                to,
                rate,
                min_amount,
            } => {
                let req = CreateRateRequest {
                    branch_id: branch,
                    from_currency: from,
                    to_currency: to,
                    rate,
                    min_amount,
                };
                print_json(&client.create_rate(&req).await?)?;
            }
            RateCommands::Update {
                id,
                rate,
                min_amount,
                active,
            } => {
                let req = UpdateRateRequest {
                    rate,
                    min_amount,
                    is_active: active,
                };
                print_json(&client.update_rate(id, &req).await?)?;
            }
            RateCommands::Quote {
                id,
                amount_from,
                amount_to,
            } => {
                let req = QuoteRequest {
                    amount_from,
                    amount_to,
                };
                print_json(&client.quote(id, &req).await?)?;
            }
        },

        Commands::Order { action } => match action {
            OrderCommands::List => print_json(&client.list_orders().await?)?,
            OrderCommands::Get { id } => print_json(&client.get_order(id).await?)?,
            OrderCommands::Create {
                branch,
                email,
                phone,
                delivery_address,
                items,
            } => {
                let req = CreateOrderRequest {
                    branch_id: branch,
                    client_email: email,
                    client_phone: phone,
                    delivery_address,
                    items,
                };
                let order = client.create_order(&req).await?;
                println!("Tracking code: {}", order.tracking_code);
                print_json(&order)?;
            }
            OrderCommands::Status { id, status } => {
                let req = UpdateOrderStatusRequest { status };
                print_json(&client.update_order_status(id, &req).await?)?;
            }
            OrderCommands::Delete { id } => {
                client.delete_order(id).await?;
                println!("✓ Order deleted");
            }
            OrderCommands::Documents { id } => print_json(&client.list_documents(id).await?)?,
            OrderCommands::Attach { id, doc_type, file } => {
                let req = AttachDocumentRequest {
                    doc_type,
                    file_handle: file,
                };
                print_json(&client.attach_document(id, &req).await?)?;
            }
        },

        Commands::Track { tracking_code } => {
            print_json(&client.track_order(&tracking_code).await?)?
        }

        Commands::Review { action } => match action {
            ReviewCommands::List => print_json(&client.list_reviews().await?)?,
            ReviewCommands::Public => print_json(&client.list_public_reviews().await?)?,
            ReviewCommands::Create {
                order,
                rating,
                text,
            } => {
                let req = CreateReviewRequest {
                    order_id: order,
                    rating,
                    text,
                };
                print_json(&client.create_review(&req).await?)?;
            }
            ReviewCommands::Show { id } => {
                print_json(&client.set_review_visibility(id, true).await?)?
            }
            ReviewCommands::Hide { id } => {
                print_json(&client.set_review_visibility(id, false).await?)?
            }
        },

        Commands::User { action } => match action {
            UserCommands::Me => print_json(&client.me().await?)?,
            UserCommands::Update {
                username,
                first_name,
                last_name,
                phone,
                telegram,
            } => {
                let req = UpdateProfileRequest {
                    username,
                    first_name,
                    last_name,
                    phone,
                    telegram,
                };
                print_json(&client.update_me(&req).await?)?;
            }
            UserCommands::Referral { code } => print_json(&client.apply_referral(&code).await?)?,
            UserCommands::Referrals => print_json(&client.list_referrals().await?)?,
            UserCommands::Roles { id, roles } => {
                let req = SetRolesRequest {
                    roles: roles.into_iter().collect::<BTreeSet<_>>(),
                };
                print_json(&client.set_roles(id, &req).await?)?;
            }
        },
    }

    Ok(())
}
